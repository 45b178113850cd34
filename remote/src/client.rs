//! TCP implementation of the remote session traits
//!
//! Requests are sent over a small pool of connections, one exchange per connection at a time.
//! A connection that returned an [`ErrorBody`](crate::protocol::ErrorBody) is healthy and goes back
//! to the pool; one that failed mid-exchange (I/O error or timeout) is dropped.

use anyhow::{Context, anyhow};
use bytes::Bytes;
use common::filter::FilterSettings;
use common::{ChunkInfo, DigestType, DirectoryStructure, FileDigest, FilePath, TransferMode};
use tracing::instrument;

use crate::protocol::{Request, Response, SessionInit};
use crate::session::{DownloadClient, ListClient, UploadClient};
use crate::streams::Connection;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub address: String,
    pub auth_token: Option<String>,
    pub max_connections: usize,
    pub connect_timeout: std::time::Duration,
    /// limit for a whole request/response exchange
    pub timeout: std::time::Duration,
}

pub struct TcpClient {
    config: ClientConfig,
    idle: std::sync::Mutex<Vec<Connection>>,
    slots: tokio::sync::Semaphore,
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("address", &self.config.address)
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

/// RAII guard that returns the connection to the pool on drop.
struct PooledConnection<'a> {
    connection: Option<Connection>,
    client: &'a TcpClient,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl PooledConnection<'_> {
    fn connection_mut(&mut self) -> anyhow::Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| anyhow!("connection already discarded"))
    }

    fn discard(&mut self) {
        if self.connection.take().is_some() {
            tracing::debug!("discarding connection to {}", self.client.config.address);
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.client.idle().push(connection);
        }
    }
}

impl TcpClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let slots = tokio::sync::Semaphore::new(config.max_connections.max(1));
        Self {
            config,
            idle: std::sync::Mutex::new(Vec::new()),
            slots,
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.idle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn connect(&self) -> anyhow::Result<Connection> {
        let address = &self.config.address;
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            tokio::net::TcpStream::connect(address),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "timed out connecting to {} after {:?}",
                address,
                self.config.connect_timeout
            )
        })?
        .with_context(|| format!("failed to connect to {address}"))?;
        stream.set_nodelay(true)?;
        tracing::debug!("connected to {}", address);
        Ok(Connection::new(stream))
    }

    async fn borrow(&self) -> anyhow::Result<PooledConnection<'_>> {
        let permit = self.slots.acquire().await?;
        let idle = self.idle().pop();
        let connection = match idle {
            Some(connection) => connection,
            None => self.connect().await?,
        };
        Ok(PooledConnection {
            connection: Some(connection),
            client: self,
            _permit: permit,
        })
    }

    /// Sends `request` (followed by `payload`, if any) and waits for the response. The raw bytes
    /// following a [`Response::Chunk`] are returned alongside it.
    #[instrument(level = "trace", skip(self, request, payload), fields(operation = request.operation()))]
    async fn exchange(
        &self,
        request: &Request,
        payload: Option<&[u8]>,
    ) -> anyhow::Result<(Response, Option<Bytes>)> {
        let operation = request.operation();
        let mut pooled = self.borrow().await?;
        let result = tokio::time::timeout(self.config.timeout, async {
            let connection = pooled.connection_mut()?;
            match payload {
                Some(data) => {
                    connection
                        .send
                        .send_message_with_data(request, data)
                        .await?
                }
                None => connection.send.send_message(request).await?,
            }
            let response = connection
                .recv
                .recv_object::<Response>()
                .await?
                .ok_or_else(|| anyhow!("connection closed by server"))?;
            let data = match &response {
                Response::Chunk { size } => {
                    let data = connection.recv.recv_data(*size).await?;
                    if data.len() as u64 != *size {
                        anyhow::bail!("server sent {} out of {} bytes", data.len(), size);
                    }
                    Some(data)
                }
                _ => None,
            };
            Ok::<_, anyhow::Error>((response, data))
        })
        .await;
        match result {
            Ok(Ok((Response::Error(body), _))) => {
                tracing::debug!("{} failed on the server: {:?}", operation, &body);
                if payload.is_some() {
                    // a refused payload may be left unread, the server then hangs up
                    pooled.discard();
                }
                Err(body.into_error().into())
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => {
                pooled.discard();
                Err(error.context(format!("{operation} failed")))
            }
            Err(_) => {
                pooled.discard();
                Err(anyhow!(
                    "{} timed out after {:?}",
                    operation,
                    self.config.timeout
                ))
            }
        }
    }

    async fn call(&self, request: Request) -> anyhow::Result<Response> {
        Ok(self.exchange(&request, None).await?.0)
    }

    fn session_init(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
    ) -> SessionInit {
        SessionInit {
            root_directory: root_directory.to_string(),
            chunk_size,
            filter: filter.clone(),
            auth_token: self.config.auth_token.clone(),
        }
    }

    async fn structure_of(
        &self,
        mode: TransferMode,
        session: &str,
    ) -> anyhow::Result<DirectoryStructure> {
        self.call(Request::Structure {
            mode,
            session: session.to_string(),
        })
        .await?
        .into_structure()
    }

    async fn file_digest_of(
        &self,
        mode: TransferMode,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        self.call(Request::FileDigest {
            mode,
            session: session.to_string(),
            file: file.clone(),
            digest_type,
        })
        .await?
        .into_digest()
    }

    async fn skip_file_of(
        &self,
        mode: TransferMode,
        session: &str,
        file: &FilePath,
    ) -> anyhow::Result<()> {
        self.call(Request::SkipFile {
            mode,
            session: session.to_string(),
            file: file.clone(),
        })
        .await?
        .into_ok()
    }

    async fn init_file_of(
        &self,
        mode: TransferMode,
        session: &str,
        file: &FilePath,
    ) -> anyhow::Result<String> {
        self.call(Request::InitFile {
            mode,
            session: session.to_string(),
            file: file.clone(),
        })
        .await?
        .into_session_id()
    }

    async fn commit_file_of(&self, mode: TransferMode, file_session: &str) -> anyhow::Result<()> {
        self.call(Request::CommitFile {
            mode,
            file_session: file_session.to_string(),
        })
        .await?
        .into_ok()
    }

    async fn abort_file_of(&self, mode: TransferMode, file_session: &str) -> anyhow::Result<()> {
        self.call(Request::AbortFile {
            mode,
            file_session: file_session.to_string(),
        })
        .await?
        .into_ok()
    }

    async fn commit_of(&self, mode: TransferMode, session: &str) -> anyhow::Result<()> {
        self.call(Request::Commit {
            mode,
            session: session.to_string(),
        })
        .await?
        .into_ok()
    }

    async fn abort_of(&self, mode: TransferMode, session: &str) -> anyhow::Result<()> {
        self.call(Request::Abort {
            mode,
            session: session.to_string(),
        })
        .await?
        .into_ok()
    }
}

#[async_trait::async_trait]
impl DownloadClient for TcpClient {
    async fn init_download(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
    ) -> anyhow::Result<String> {
        let init = self.session_init(root_directory, chunk_size, filter);
        self.call(Request::InitDownload(init))
            .await?
            .into_session_id()
    }

    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure> {
        self.structure_of(TransferMode::Download, session).await
    }

    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        self.file_digest_of(TransferMode::Download, session, file, digest_type)
            .await
    }

    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()> {
        self.skip_file_of(TransferMode::Download, session, file)
            .await
    }

    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String> {
        self.init_file_of(TransferMode::Download, session, file)
            .await
    }

    async fn download_chunk(&self, file_session: &str, chunk: ChunkInfo) -> anyhow::Result<Bytes> {
        let request = Request::DownloadChunk {
            file_session: file_session.to_string(),
            chunk,
        };
        match self.exchange(&request, None).await? {
            (Response::Chunk { .. }, Some(data)) if data.len() as u64 == chunk.size => Ok(data),
            (Response::Chunk { size }, _) => Err(anyhow!(
                "requested chunk {} but server sent {} bytes",
                chunk,
                size
            )),
            (other, _) => Err(anyhow!("expected Chunk response, got {:?}", other)),
        }
    }

    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.commit_file_of(TransferMode::Download, file_session)
            .await
    }

    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.abort_file_of(TransferMode::Download, file_session)
            .await
    }

    async fn commit(&self, session: &str) -> anyhow::Result<()> {
        self.commit_of(TransferMode::Download, session).await
    }

    async fn abort(&self, session: &str) -> anyhow::Result<()> {
        self.abort_of(TransferMode::Download, session).await
    }
}

#[async_trait::async_trait]
impl UploadClient for TcpClient {
    async fn init_upload(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
        manifest: &DirectoryStructure,
    ) -> anyhow::Result<String> {
        let init = self.session_init(root_directory, chunk_size, filter);
        self.call(Request::InitUpload {
            init,
            manifest: manifest.clone(),
        })
        .await?
        .into_session_id()
    }

    async fn structure(&self, session: &str) -> anyhow::Result<DirectoryStructure> {
        self.structure_of(TransferMode::Upload, session).await
    }

    async fn create_directories(&self, session: &str) -> anyhow::Result<()> {
        self.call(Request::CreateDirectories {
            session: session.to_string(),
        })
        .await?
        .into_ok()
    }

    async fn delete_files(
        &self,
        session: &str,
        files: &[FilePath],
        directories: &[FilePath],
    ) -> anyhow::Result<()> {
        self.call(Request::DeleteFiles {
            session: session.to_string(),
            files: files.to_vec(),
            directories: directories.to_vec(),
        })
        .await?
        .into_ok()
    }

    async fn file_digest(
        &self,
        session: &str,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        self.file_digest_of(TransferMode::Upload, session, file, digest_type)
            .await
    }

    async fn skip_file(&self, session: &str, file: &FilePath) -> anyhow::Result<()> {
        self.skip_file_of(TransferMode::Upload, session, file).await
    }

    async fn init_file(&self, session: &str, file: &FilePath) -> anyhow::Result<String> {
        self.init_file_of(TransferMode::Upload, session, file).await
    }

    async fn upload_chunk(
        &self,
        file_session: &str,
        chunk: ChunkInfo,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let request = Request::UploadChunk {
            file_session: file_session.to_string(),
            chunk,
        };
        self.exchange(&request, Some(&data)).await?.0.into_ok()
    }

    async fn commit_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.commit_file_of(TransferMode::Upload, file_session)
            .await
    }

    async fn abort_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.abort_file_of(TransferMode::Upload, file_session).await
    }

    async fn delete_file(&self, file_session: &str) -> anyhow::Result<()> {
        self.call(Request::DeleteFile {
            file_session: file_session.to_string(),
        })
        .await?
        .into_ok()
    }

    async fn commit(&self, session: &str) -> anyhow::Result<()> {
        self.commit_of(TransferMode::Upload, session).await
    }

    async fn abort(&self, session: &str) -> anyhow::Result<()> {
        self.abort_of(TransferMode::Upload, session).await
    }
}

#[async_trait::async_trait]
impl ListClient for TcpClient {
    async fn list(
        &self,
        root_directory: &str,
        filter: &FilterSettings,
    ) -> anyhow::Result<DirectoryStructure> {
        let init = self.session_init(root_directory, 0, filter);
        self.call(Request::List(init)).await?.into_structure()
    }
}
