//! Transfers through a `dsync::server` listening on loopback

use common::TransferOptions;
use common::filter::FilterSettings;
use dsync::{Authenticator, DownloadExecutor, RegistryConfig, SessionRegistry, UploadExecutor};
use remote::{ClientConfig, TcpClient};
use std::sync::Arc;

struct Server {
    address: String,
    registry: Arc<SessionRegistry>,
}

async fn start_server(auth: Authenticator) -> Server {
    let registry = Arc::new(SessionRegistry::new(auth, RegistryConfig::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(dsync::server::serve(listener, registry.clone()));
    Server { address, registry }
}

fn client(server: &Server, auth_token: Option<&str>, options: &TransferOptions) -> Arc<TcpClient> {
    Arc::new(TcpClient::new(ClientConfig {
        address: server.address.clone(),
        auth_token: auth_token.map(str::to_string),
        max_connections: options.num_connections + 1,
        connect_timeout: options.connect_timeout,
        timeout: options.timeout,
    }))
}

fn options() -> TransferOptions {
    TransferOptions {
        num_connections: 3,
        chunk_size: 16,
        delete_unexpected: true,
        ..Default::default()
    }
}

fn populate(root: &std::path::Path) {
    std::fs::create_dir_all(root.join("sub/dir")).unwrap();
    std::fs::write(root.join("small.txt"), "small").unwrap();
    std::fs::write(root.join("sub/dir/quote'd [name].txt"), "odd name").unwrap();
    let big: Vec<u8> = (0..5_000u32).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(root.join("sub/big.bin"), big).unwrap();
}

fn assert_same_content(first: &std::path::Path, second: &std::path::Path) {
    for name in ["small.txt", "sub/dir/quote'd [name].txt", "sub/big.bin"] {
        assert_eq!(
            std::fs::read(first.join(name)).unwrap(),
            std::fs::read(second.join(name)).unwrap(),
            "{name}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_then_download_over_tcp() -> anyhow::Result<()> {
    let server = start_server(Authenticator::Token("secret".to_string())).await;
    let local = tempfile::tempdir()?;
    let remote = tempfile::tempdir()?;
    let back = tempfile::tempdir()?;
    populate(local.path());
    let options = options();
    let summary = UploadExecutor::new(
        client(&server, Some("secret"), &options),
        local.path().to_path_buf(),
        remote.path().to_string_lossy().into_owned(),
        FilterSettings::new(),
        options,
    )
    .execute()
    .await
    .map_err(|error| error.source)?;
    assert_eq!(summary.files_transferred, 3);
    assert_same_content(local.path(), remote.path());
    // something for delete-unexpected to clean up on the way back
    std::fs::write(back.path().join("leftover"), "left over")?;
    let summary = DownloadExecutor::new(
        client(&server, Some("secret"), &options),
        back.path().to_path_buf(),
        remote.path().to_string_lossy().into_owned(),
        FilterSettings::new(),
        options,
    )
    .execute()
    .await
    .map_err(|error| error.source)?;
    assert_eq!(summary.files_transferred, 3);
    assert_eq!(summary.deleted_files, 1);
    assert_same_content(local.path(), back.path());
    assert!(!back.path().join("leftover").exists());
    assert_eq!(server.registry.active_sessions(), 0);
    assert_eq!(server.registry.stats().committed, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filters_apply_to_both_sides() -> anyhow::Result<()> {
    let server = start_server(Authenticator::NoAuth).await;
    let local = tempfile::tempdir()?;
    let remote = tempfile::tempdir()?;
    populate(remote.path());
    let mut filter = FilterSettings::new();
    filter.add_exclude("**/*.bin")?;
    let options = options();
    DownloadExecutor::new(
        client(&server, None, &options),
        local.path().to_path_buf(),
        remote.path().to_string_lossy().into_owned(),
        filter,
        options,
    )
    .execute()
    .await
    .map_err(|error| error.source)?;
    assert!(local.path().join("small.txt").exists());
    assert!(!local.path().join("sub/big.bin").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_token_is_rejected() {
    let server = start_server(Authenticator::Token("secret".to_string())).await;
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    populate(local.path());
    let options = options();
    let error = UploadExecutor::new(
        client(&server, Some("guess"), &options),
        local.path().to_path_buf(),
        remote.path().to_string_lossy().into_owned(),
        FilterSettings::new(),
        options,
    )
    .execute()
    .await
    .unwrap_err();
    assert!(format!("{error}").contains("invalid auth token"), "{error}");
    assert_eq!(server.registry.active_sessions(), 0);
    assert!(!remote.path().join("small.txt").exists());
}
