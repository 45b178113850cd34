//! End-to-end transfers between two local directories through the in-process client

use common::filter::FilterSettings;
use common::progress::Summary;
use common::TransferOptions;
use dsync::{Authenticator, DownloadExecutor, LocalClient, RegistryConfig, SessionRegistry, UploadExecutor};
use remote::DownloadClient;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

fn registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        Authenticator::NoAuth,
        RegistryConfig::default(),
    ))
}

fn options(chunk_size: u64) -> TransferOptions {
    TransferOptions {
        num_connections: 4,
        chunk_size,
        ..Default::default()
    }
}

async fn download(
    registry: &Arc<SessionRegistry>,
    remote: &Path,
    local: &Path,
    options: TransferOptions,
) -> anyhow::Result<Summary> {
    let client = Arc::new(LocalClient::new(registry.clone(), None));
    DownloadExecutor::new(
        client,
        local.to_path_buf(),
        remote.to_string_lossy().into_owned(),
        FilterSettings::new(),
        options,
    )
    .execute()
    .await
    .map_err(|error| error.source)
}

async fn upload(
    registry: &Arc<SessionRegistry>,
    local: &Path,
    remote: &Path,
    options: TransferOptions,
) -> anyhow::Result<Summary> {
    let client = Arc::new(LocalClient::new(registry.clone(), None));
    UploadExecutor::new(
        client,
        local.to_path_buf(),
        remote.to_string_lossy().into_owned(),
        FilterSettings::new(),
        options,
    )
    .execute()
    .await
    .map_err(|error| error.source)
}

fn write_file(path: &Path, content: &[u8], mode: u32, mtime_seconds: i64) {
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime_seconds, 0)).unwrap();
}

fn mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

fn mtime_seconds(path: &Path) -> i64 {
    filetime::FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap()).unix_seconds()
}

/// ```text
/// |- a.txt            (0o644)
/// |- big.bin          (spans many chunks)
/// |- empty
/// |- nested
///    |- deeper
///       |- b.txt      (0o600)
/// |- empty-dir
/// ```
fn source_tree() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_file(&root.join("a.txt"), b"alpha", 0o644, 1_600_000_000);
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    write_file(&root.join("big.bin"), &big, 0o644, 1_600_000_100);
    write_file(&root.join("empty"), b"", 0o644, 1_600_000_200);
    std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
    write_file(&root.join("nested/deeper/b.txt"), b"bravo", 0o600, 1_600_000_300);
    std::fs::create_dir(root.join("empty-dir")).unwrap();
    tmp
}

fn assert_same_file(source: &Path, destination: &Path) {
    assert_eq!(std::fs::read(source).unwrap(), std::fs::read(destination).unwrap());
    assert_eq!(mode(source), mode(destination), "mode of {destination:?}");
    assert_eq!(mtime_seconds(source), mtime_seconds(destination), "mtime of {destination:?}");
}

fn assert_same_tree(source: &Path, destination: &Path) {
    for name in ["a.txt", "big.bin", "empty", "nested/deeper/b.txt"] {
        assert_same_file(&source.join(name), &destination.join(name));
    }
    assert!(destination.join("empty-dir").is_dir());
}

#[tokio::test]
async fn download_copies_tree_and_second_run_moves_nothing() -> anyhow::Result<()> {
    let source = source_tree();
    let destination = tempfile::tempdir()?;
    let local = destination.path().join("copy");
    let registry = registry();
    let summary = download(&registry, source.path(), &local, options(1024)).await?;
    assert_same_tree(source.path(), &local);
    assert_eq!(summary.files_total, 4);
    assert_eq!(summary.files_transferred, 4);
    assert_eq!(summary.bytes_transferred, 10_010);
    assert_eq!(registry.active_sessions(), 0);
    let summary = download(&registry, source.path(), &local, options(1024)).await?;
    assert_eq!(summary.files_skipped, 4);
    assert_eq!(summary.bytes_transferred, 0);
    assert_eq!(summary.chunks_transferred, 0);
    assert_eq!(registry.stats().committed, 2);
    Ok(())
}

#[tokio::test]
async fn upload_copies_tree_and_second_run_moves_nothing() -> anyhow::Result<()> {
    let source = source_tree();
    let destination = tempfile::tempdir()?;
    let remote = destination.path().join("copy");
    let registry = registry();
    let summary = upload(&registry, source.path(), &remote, options(1024)).await?;
    assert_same_tree(source.path(), &remote);
    assert_eq!(summary.files_transferred, 4);
    assert_eq!(summary.bytes_transferred, 10_010);
    let summary = upload(&registry, source.path(), &remote, options(1024)).await?;
    assert_eq!(summary.files_skipped, 4);
    assert_eq!(summary.bytes_transferred, 0);
    assert_eq!(registry.active_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn only_changed_chunks_move() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    write_file(&source.path().join("f"), b"0123456789abcdefghij--ver1", 0o644, 2_000_000);
    // older than the source, so metadata alone doesn't vouch for it
    write_file(&destination.path().join("f"), b"0123456789abcdefghij--ver2", 0o644, 1_000_000);
    let summary = download(&registry(), source.path(), destination.path(), options(10)).await?;
    assert_eq!(summary.chunks_skipped, 2);
    assert_eq!(summary.bytes_skipped, 20);
    assert_eq!(summary.chunks_transferred, 1);
    assert_eq!(summary.bytes_transferred, 6);
    assert_same_file(&source.path().join("f"), &destination.path().join("f"));
    Ok(())
}

#[tokio::test]
async fn shrunk_file_is_truncated() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    write_file(&source.path().join("f"), b"short", 0o644, 2_000_000);
    write_file(&destination.path().join("f"), b"a much longer old version", 0o644, 1_000_000);
    upload(&registry(), source.path(), destination.path(), options(4)).await?;
    assert_eq!(std::fs::read(destination.path().join("f"))?, b"short");
    Ok(())
}

#[tokio::test]
async fn permission_mismatch_only_fixes_metadata() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    write_file(&source.path().join("f"), b"same", 0o644, 1_000_000);
    write_file(&destination.path().join("f"), b"same", 0o600, 1_000_000);
    let summary = upload(&registry(), source.path(), destination.path(), options(1024)).await?;
    assert_eq!(summary.files_metadata_only, 1);
    assert_eq!(summary.bytes_transferred, 0);
    assert_eq!(mode(&destination.path().join("f")), 0o644);
    Ok(())
}

#[tokio::test]
async fn metadata_only_integrity_resends_changed_files_whole() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    write_file(&source.path().join("f"), b"0123456789abcdefghij--ver1", 0o644, 2_000_000);
    write_file(&destination.path().join("f"), b"0123456789abcdefghij--ver2", 0o644, 1_000_000);
    let options = TransferOptions {
        integrity: common::FileIntegrityOptions {
            check: common::IntegrityCheck::OnlyFileMetadata,
            ..Default::default()
        },
        ..options(10)
    };
    let summary = download(&registry(), source.path(), destination.path(), options).await?;
    assert_eq!(summary.chunks_skipped, 0);
    assert_eq!(summary.bytes_transferred, 26);
    assert_same_file(&source.path().join("f"), &destination.path().join("f"));
    Ok(())
}

fn destination_with_extras() -> tempfile::TempDir {
    let destination = tempfile::tempdir().unwrap();
    let root = destination.path();
    write_file(&root.join("stale.txt"), b"stale", 0o644, 1_000_000);
    std::fs::create_dir_all(root.join("old/inner")).unwrap();
    write_file(&root.join("old/inner/x.txt"), b"x", 0o644, 1_000_000);
    destination
}

#[tokio::test]
async fn unexpected_entries_are_deleted_on_request() -> anyhow::Result<()> {
    let source = source_tree();
    for delete_unexpected in [false, true] {
        let destination = destination_with_extras();
        let options = TransferOptions {
            delete_unexpected,
            ..options(1024)
        };
        let summary = download(&registry(), source.path(), destination.path(), options).await?;
        assert_same_tree(source.path(), destination.path());
        let root = destination.path();
        assert_eq!(root.join("stale.txt").exists(), !delete_unexpected);
        assert_eq!(root.join("old").exists(), !delete_unexpected);
        if delete_unexpected {
            assert_eq!(summary.deleted_files, 2);
            assert_eq!(summary.deleted_directories, 2);
        } else {
            assert_eq!(summary.deleted_files, 0);
        }
    }
    Ok(())
}

#[tokio::test]
async fn upload_deletes_unexpected_remote_entries() -> anyhow::Result<()> {
    let source = source_tree();
    let destination = destination_with_extras();
    let options = TransferOptions {
        delete_unexpected: true,
        ..options(1024)
    };
    upload(&registry(), source.path(), destination.path(), options).await?;
    assert_same_tree(source.path(), destination.path());
    assert!(!destination.path().join("stale.txt").exists());
    assert!(!destination.path().join("old").exists());
    Ok(())
}

#[tokio::test]
async fn empty_trees_sync() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    let summary = download(&registry(), source.path(), destination.path(), options(1024)).await?;
    assert_eq!(summary, Summary::default());
    let summary = upload(&registry(), source.path(), destination.path(), options(1024)).await?;
    assert_eq!(summary, Summary::default());
    assert_eq!(std::fs::read_dir(destination.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn unusual_file_names_survive() -> anyhow::Result<()> {
    let source = tempfile::tempdir()?;
    let destination = tempfile::tempdir()?;
    let names = [
        "quote'd \"name\".txt",
        "[brackets] and {braces}",
        "back\\slash",
        "spaces and ünïcödé",
        "semi;colon&amp",
    ];
    std::fs::create_dir(source.path().join("dir with spaces"))?;
    for name in names {
        write_file(&source.path().join(name), name.as_bytes(), 0o644, 1_000_000);
        write_file(
            &source.path().join("dir with spaces").join(name),
            name.as_bytes(),
            0o644,
            1_000_000,
        );
    }
    upload(&registry(), source.path(), destination.path(), options(4)).await?;
    for name in names {
        assert_same_file(&source.path().join(name), &destination.path().join(name));
        assert_same_file(
            &source.path().join("dir with spaces").join(name),
            &destination.path().join("dir with spaces").join(name),
        );
    }
    Ok(())
}

#[tokio::test]
async fn overlapping_roots_are_refused() -> anyhow::Result<()> {
    let source = source_tree();
    let destination = tempfile::tempdir()?;
    let registry = registry();
    let client = LocalClient::new(registry.clone(), None);
    let root = source.path().to_string_lossy().into_owned();
    let session = client.init_download(&root, 1024, &FilterSettings::new()).await?;
    let error = upload(&registry, destination.path(), &source.path().join("nested"), options(1024))
        .await
        .unwrap_err();
    assert!(
        matches!(
            error.downcast_ref::<common::TransferError>(),
            Some(common::TransferError::OverlappingRoot { .. })
        ),
        "{error:#}"
    );
    client.commit(&session).await?;
    upload(&registry, destination.path(), &source.path().join("nested"), options(1024)).await?;
    Ok(())
}

#[tokio::test]
async fn missing_remote_root_fails_without_leaking_a_session() {
    let destination = tempfile::tempdir().unwrap();
    let registry = registry();
    let result = download(
        &registry,
        Path::new("/definitely/not/a/directory"),
        destination.path(),
        options(1024),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(registry.active_sessions(), 0);
}
