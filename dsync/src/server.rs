//! TCP front end of a [`SessionRegistry`]
//!
//! Every accepted connection gets its own task which reads requests one after another, runs them
//! against the registry and writes back exactly one response per request. Failures are sent back
//! as [`ErrorBody`] and the connection stays usable.

use anyhow::Context;
use bytes::Bytes;
use common::ErrorKind;
use common::error::error_kind;
use remote::protocol::{ErrorBody, Request, Response, SessionInit};
use remote::streams::Connection;
use remote::{DownloadClient, ListClient, UploadClient};
use std::sync::Arc;
use tracing::instrument;

use crate::local::LocalClient;
use crate::registry::SessionRegistry;

/// How long a connection is kept around for the peer to hang up after a refused chunk.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Accepts connections on `listener` until the task is dropped.
pub async fn serve(
    listener: tokio::net::TcpListener,
    registry: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    tracing::info!("serving on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::error!("failed accepting connection: {}", error);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::warn!("cannot set TCP_NODELAY for {}: {}", peer, error);
        }
        let registry = registry.clone();
        tokio::spawn(async move {
            tracing::debug!("accepted connection from {}", peer);
            match handle_connection(registry, stream).await {
                Ok(()) => tracing::debug!("connection from {} closed", peer),
                Err(error) => tracing::debug!("connection from {} dropped: {:#}", peer, error),
            }
        });
    }
}

async fn handle_connection(
    registry: Arc<SessionRegistry>,
    stream: tokio::net::TcpStream,
) -> anyhow::Result<()> {
    let mut connection = Connection::new(stream);
    while let Some(request) = connection.recv.recv_object::<Request>().await? {
        let operation = request.operation();
        let payload = match &request {
            Request::UploadChunk {
                file_session,
                chunk,
            } => {
                if let Err(error) = registry
                    .file_upload(file_session)
                    .and_then(|file_session| file_session.check_chunk(*chunk))
                {
                    // the declared size of the raw bytes that follow can't be trusted, so the
                    // connection ends here
                    let error = anyhow::Error::from(error);
                    log_failure(operation, &error);
                    let body = ErrorBody::from_error(&error, operation);
                    connection.send.send_message(&Response::Error(body)).await?;
                    connection.send.close().await?;
                    let drained =
                        tokio::time::timeout(DRAIN_TIMEOUT, connection.recv.drain()).await;
                    tracing::debug!("dropping connection after refused chunk: {:?}", drained);
                    return Ok(());
                }
                Some(
                    connection
                        .recv
                        .recv_data(chunk.size)
                        .await
                        .context("failed receiving chunk data")?,
                )
            }
            _ => None,
        };
        match dispatch(&registry, request, payload).await {
            Ok((response, Some(data))) => {
                connection
                    .send
                    .send_message_with_data(&response, &data)
                    .await?
            }
            Ok((response, None)) => connection.send.send_message(&response).await?,
            Err(error) => {
                log_failure(operation, &error);
                let body = ErrorBody::from_error(&error, operation);
                connection.send.send_message(&Response::Error(body)).await?;
            }
        }
    }
    Ok(())
}

fn log_failure(operation: &str, error: &anyhow::Error) {
    match error_kind(error) {
        ErrorKind::FileDeleted => tracing::info!("{} failed: {:#}", operation, error),
        ErrorKind::IllegalState => tracing::warn!("{} failed: {:#}", operation, error),
        ErrorKind::Unknown => tracing::error!("{} failed: {:#}", operation, error),
    }
}

fn authenticated(registry: &Arc<SessionRegistry>, init: &SessionInit) -> LocalClient {
    LocalClient::new(registry.clone(), init.auth_token.clone())
}

/// Runs one request; `payload` carries the bytes that followed an upload-chunk request.
#[instrument(level = "trace", skip_all, fields(operation = request.operation()))]
async fn dispatch(
    registry: &Arc<SessionRegistry>,
    request: Request,
    payload: Option<Bytes>,
) -> anyhow::Result<(Response, Option<Bytes>)> {
    use common::TransferMode::{Download, Upload};
    let local = LocalClient::new(registry.clone(), None);
    let response = match request {
        Request::InitDownload(init) => Response::SessionId(
            authenticated(registry, &init)
                .init_download(&init.root_directory, init.chunk_size, &init.filter)
                .await?,
        ),
        Request::InitUpload { init, manifest } => Response::SessionId(
            authenticated(registry, &init)
                .init_upload(&init.root_directory, init.chunk_size, &init.filter, &manifest)
                .await?,
        ),
        Request::List(init) => Response::Structure(
            authenticated(registry, &init)
                .list(&init.root_directory, &init.filter)
                .await?,
        ),
        Request::Structure { mode, session } => Response::Structure(match mode {
            Download => DownloadClient::structure(&local, &session).await?,
            Upload => UploadClient::structure(&local, &session).await?,
        }),
        Request::FileDigest {
            mode,
            session,
            file,
            digest_type,
        } => Response::Digest(match mode {
            Download => DownloadClient::file_digest(&local, &session, &file, digest_type).await?,
            Upload => UploadClient::file_digest(&local, &session, &file, digest_type).await?,
        }),
        Request::SkipFile {
            mode,
            session,
            file,
        } => {
            match mode {
                Download => DownloadClient::skip_file(&local, &session, &file).await?,
                Upload => UploadClient::skip_file(&local, &session, &file).await?,
            }
            Response::Ok
        }
        Request::InitFile {
            mode,
            session,
            file,
        } => Response::SessionId(match mode {
            Download => DownloadClient::init_file(&local, &session, &file).await?,
            Upload => UploadClient::init_file(&local, &session, &file).await?,
        }),
        Request::DownloadChunk {
            file_session,
            chunk,
        } => {
            let data = local.download_chunk(&file_session, chunk).await?;
            return Ok((
                Response::Chunk {
                    size: data.len() as u64,
                },
                Some(data),
            ));
        }
        Request::UploadChunk {
            file_session,
            chunk,
        } => {
            let data = payload.unwrap_or_default();
            local.upload_chunk(&file_session, chunk, data).await?;
            Response::Ok
        }
        Request::CommitFile { mode, file_session } => {
            match mode {
                Download => DownloadClient::commit_file(&local, &file_session).await?,
                Upload => UploadClient::commit_file(&local, &file_session).await?,
            }
            Response::Ok
        }
        Request::AbortFile { mode, file_session } => {
            match mode {
                Download => DownloadClient::abort_file(&local, &file_session).await?,
                Upload => UploadClient::abort_file(&local, &file_session).await?,
            }
            Response::Ok
        }
        Request::DeleteFile { file_session } => {
            local.delete_file(&file_session).await?;
            Response::Ok
        }
        Request::CreateDirectories { session } => {
            local.create_directories(&session).await?;
            Response::Ok
        }
        Request::DeleteFiles {
            session,
            files,
            directories,
        } => {
            local.delete_files(&session, &files, &directories).await?;
            Response::Ok
        }
        Request::Commit { mode, session } => {
            match mode {
                Download => DownloadClient::commit(&local, &session).await?,
                Upload => UploadClient::commit(&local, &session).await?,
            }
            Response::Ok
        }
        Request::Abort { mode, session } => {
            match mode {
                Download => DownloadClient::abort(&local, &session).await?,
                Upload => UploadClient::abort(&local, &session).await?,
            }
            Response::Ok
        }
    };
    Ok((response, None))
}
