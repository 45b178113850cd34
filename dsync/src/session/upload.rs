//! Upload session: the server is the destination
//!
//! The client sends a manifest of what its source tree looks like when opening the session. Only
//! files listed in the manifest may be written, and their final size, modification time and
//! permissions are taken from it.

use bytes::Bytes;
use common::file_pool::{AccessMode, RandomAccessFilePool};
use common::filter::FilterSettings;
use common::{
    ChunkInfo, DigestType, DirectoryStructure, FileDigest, FileMetadata, FilePath, TransferError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

use super::{Activity, Phase};

struct State {
    phase: Phase,
    file_sessions: HashMap<String, Arc<FileUploadSession>>,
}

pub struct UploadSession {
    id: String,
    root: std::path::PathBuf,
    chunk_size: u64,
    filter: FilterSettings,
    max_open_handles: usize,
    manifest: DirectoryStructure,
    files: HashMap<FilePath, FileMetadata>,
    activity: Activity,
    state: std::sync::Mutex<State>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl UploadSession {
    /// Creates `root` if needed and opens a session expecting the files in `manifest`.
    #[instrument(skip(filter, manifest))]
    pub async fn new(
        id: String,
        root: std::path::PathBuf,
        chunk_size: u64,
        filter: &FilterSettings,
        manifest: DirectoryStructure,
        max_open_handles: usize,
    ) -> anyhow::Result<Self> {
        let files = manifest.files_by_path()?;
        tokio::fs::create_dir_all(&root).await.map_err(|err| {
            anyhow::Error::from(err).context(format!("cannot create root directory {:?}", &root))
        })?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(TransferError::NotDirectory(root).into());
        }
        tracing::info!(
            "upload session {} over {:?}: expecting {} files, {} directories",
            id,
            root,
            manifest.files.len(),
            manifest.directories.len()
        );
        Ok(Self {
            id,
            root,
            chunk_size,
            filter: filter.clone(),
            max_open_handles,
            manifest,
            files,
            activity: Activity::default(),
            state: std::sync::Mutex::new(State {
                phase: Phase::Active,
                file_sessions: HashMap::new(),
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.activity.idle_for()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Scans the destination as it is right now.
    pub async fn structure(&self) -> anyhow::Result<DirectoryStructure> {
        self.activity.touch();
        common::scan::read_directory_structure(&self.root, &self.filter).await
    }

    pub async fn create_directories(&self) -> anyhow::Result<()> {
        self.activity.touch();
        common::metadata::create_directories(&self.root, &self.manifest.directories).await
    }

    /// Removes destination entries that don't exist at the source.
    pub async fn delete_files(
        &self,
        files: &[FilePath],
        directories: &[FilePath],
    ) -> anyhow::Result<()> {
        self.activity.touch();
        tracing::info!(
            "session {}: removing {} unexpected files and {} directories",
            self.id,
            files.len(),
            directories.len()
        );
        common::rm::remove_entries(&self.root, files, directories).await
    }

    fn registered(&self, file: &FilePath) -> Result<&FileMetadata, TransferError> {
        self.files
            .get(file)
            .ok_or_else(|| TransferError::FileNotSpecified {
                path: file.clone(),
                session: self.id.clone(),
            })
    }

    pub async fn file_digest(
        &self,
        file: &FilePath,
        digest_type: DigestType,
    ) -> anyhow::Result<FileDigest> {
        self.activity.touch();
        self.registered(file)?;
        common::digest::file_digest(
            file.resolve(&self.root),
            file.clone(),
            self.chunk_size,
            digest_type,
        )
        .await
    }

    pub fn skip_file(&self, file: &FilePath) -> Result<(), TransferError> {
        self.activity.touch();
        self.registered(file)?;
        tracing::debug!("session {}: client skips {}", self.id, file);
        Ok(())
    }

    /// Opens a read-write pool over `file` and resizes the file to its final size, so chunks can
    /// then be written in any order.
    pub async fn init_file(&self, file: &FilePath) -> anyhow::Result<String> {
        self.activity.touch();
        let metadata = self.registered(file)?.clone();
        if self.phase() != Phase::Active {
            return Err(TransferError::AlreadyCommitted(self.id.clone()).into());
        }
        let pool = RandomAccessFilePool::new(
            file.resolve(&self.root),
            file.clone(),
            AccessMode::ReadWrite,
            self.max_open_handles,
        );
        pool.borrow().await?.set_len(metadata.size).await?;
        let id = super::new_file_session_id(&self.id);
        let file_session = Arc::new(FileUploadSession {
            id: id.clone(),
            chunk_size: self.chunk_size,
            root: self.root.clone(),
            metadata,
            pool,
            committed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        });
        let mut state = self.state();
        if state.phase != Phase::Active {
            file_session.abort();
            return Err(TransferError::AlreadyCommitted(self.id.clone()).into());
        }
        state.file_sessions.insert(id.clone(), file_session);
        tracing::debug!("session {}: opened file session {} for {}", self.id, id, file);
        Ok(id)
    }

    pub fn file_session(&self, id: &str) -> Result<Arc<FileUploadSession>, TransferError> {
        self.activity.touch();
        self.state()
            .file_sessions
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotExists(id.to_string()))
    }

    pub fn commit(&self) -> Result<(), TransferError> {
        self.activity.touch();
        let mut state = self.state();
        if state.phase != Phase::Active {
            return Err(TransferError::AlreadyCommitted(self.id.clone()));
        }
        state.phase = Phase::Committed;
        for file_session in state.file_sessions.values() {
            file_session.pool.close();
        }
        tracing::info!("upload session {} committed", self.id);
        Ok(())
    }

    /// Terminates the session, interrupting chunk writes still in flight.
    pub fn abort(&self) {
        self.activity.touch();
        let mut state = self.state();
        state.phase = Phase::Aborted;
        for file_session in state.file_sessions.values() {
            file_session.abort();
        }
        tracing::info!("upload session {} aborted", self.id);
    }
}

#[derive(Debug)]
pub struct FileUploadSession {
    id: String,
    chunk_size: u64,
    root: std::path::PathBuf,
    metadata: FileMetadata,
    pool: Arc<RandomAccessFilePool>,
    committed: AtomicBool,
    deleted: AtomicBool,
}

impl FileUploadSession {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    fn check_not_committed(&self) -> Result<(), TransferError> {
        if self.committed.load(Ordering::Acquire) {
            return Err(TransferError::AlreadyCommitted(self.id.clone()));
        }
        Ok(())
    }

    /// Rejects chunks larger than the session chunk size or reaching past the end of the file.
    pub fn check_chunk(&self, chunk: ChunkInfo) -> Result<(), TransferError> {
        common::chunk::check_bounds(chunk, self.chunk_size, self.metadata.size)
    }

    /// Writes `data` at `chunk.offset`; `data` must be exactly `chunk.size` bytes long.
    pub async fn upload_chunk(&self, chunk: ChunkInfo, data: Bytes) -> anyhow::Result<()> {
        self.check_not_committed()?;
        self.check_chunk(chunk)?;
        let mut lease = self.pool.borrow().await?;
        lease.write_chunk(chunk, &data).await
    }

    /// Closes the file and applies the manifest's modification time and permissions, unless the
    /// file was deleted in the meantime.
    pub async fn commit(&self) -> anyhow::Result<()> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Err(TransferError::AlreadyCommitted(self.id.clone()).into());
        }
        self.pool.close();
        if !self.deleted.load(Ordering::Acquire) {
            common::metadata::write_file_metadata(&self.root, &self.metadata).await?;
        }
        Ok(())
    }

    /// Removes the destination file instead of committing it.
    pub async fn delete(&self) -> anyhow::Result<()> {
        self.check_not_committed()?;
        self.pool.close();
        let path = self.metadata.file_path.resolve(&self.root);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(anyhow::Error::from(error).context(format!("cannot remove {:?}", &path)));
            }
        }
        self.deleted.store(true, Ordering::Release);
        tracing::info!("file session {}: removed {}", self.id, self.metadata.file_path);
        Ok(())
    }

    pub fn abort(&self) {
        self.pool.force_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DirectoryMetadata, ErrorKind};
    use common::error::error_kind;

    fn manifest(files: &[(&str, u64)]) -> DirectoryStructure {
        DirectoryStructure {
            root_directory: "/source".to_string(),
            directories: vec![DirectoryMetadata {
                file_path: FilePath::new("", "sub"),
                permissions: Some(0o750),
            }],
            files: files
                .iter()
                .map(|(name, size)| FileMetadata {
                    file_path: FilePath::new("sub", *name),
                    size: *size,
                    last_modified: 1_600_000_000_000,
                    permissions: Some(0o640),
                })
                .collect(),
        }
    }

    async fn open(root: &std::path::Path, files: &[(&str, u64)]) -> anyhow::Result<UploadSession> {
        UploadSession::new(
            "u1".to_string(),
            root.to_path_buf(),
            4,
            &FilterSettings::new(),
            manifest(files),
            8,
        )
        .await
    }

    #[tokio::test]
    async fn chunks_land_in_preallocated_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("dst");
        let session = open(&root, &[("a.bin", 6)]).await?;
        session.create_directories().await?;
        let file = FilePath::new("sub", "a.bin");
        let file_session = session.file_session(&session.init_file(&file).await?)?;
        assert_eq!(std::fs::metadata(file.resolve(&root))?.len(), 6);
        file_session
            .upload_chunk(ChunkInfo { offset: 4, size: 2 }, Bytes::from_static(b"ef"))
            .await?;
        file_session
            .upload_chunk(ChunkInfo { offset: 0, size: 4 }, Bytes::from_static(b"abcd"))
            .await?;
        file_session.commit().await?;
        assert_eq!(std::fs::read(file.resolve(&root))?, b"abcdef");
        let written = common::metadata::read_file_metadata(&root, &file).await?;
        assert_eq!(written.last_modified, 1_600_000_000_000);
        assert_eq!(written.permissions, Some(0o640));
        assert!(file_session.commit().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn short_chunk_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path(), &[("a.bin", 4)]).await?;
        session.create_directories().await?;
        let file_session =
            session.file_session(&session.init_file(&FilePath::new("sub", "a.bin")).await?)?;
        let error = file_session
            .upload_chunk(ChunkInfo { offset: 0, size: 4 }, Bytes::from_static(b"ab"))
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TransferError>(),
            Some(TransferError::InputStreamSizeMismatch { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path(), &[("a.bin", 6)]).await?;
        session.create_directories().await?;
        let file_session =
            session.file_session(&session.init_file(&FilePath::new("sub", "a.bin")).await?)?;
        for chunk in [
            ChunkInfo { offset: 0, size: 6 },
            ChunkInfo { offset: 4, size: 4 },
        ] {
            assert!(matches!(
                file_session.check_chunk(chunk),
                Err(TransferError::ChunkOutOfBounds { .. })
            ));
        }
        let error = file_session
            .upload_chunk(ChunkInfo { offset: 4, size: 4 }, Bytes::from_static(b"efgh"))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&error), ErrorKind::IllegalState);
        assert_eq!(std::fs::metadata(tmp.path().join("sub/a.bin"))?.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_file_commits_without_metadata() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path(), &[("a.bin", 4)]).await?;
        session.create_directories().await?;
        let file = FilePath::new("sub", "a.bin");
        let file_session = session.file_session(&session.init_file(&file).await?)?;
        file_session.delete().await?;
        assert!(!file.resolve(tmp.path()).exists());
        file_session.commit().await?;
        assert!(!file.resolve(tmp.path()).exists());
        assert!(file_session.delete().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn only_manifest_files_are_accepted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path(), &[("a.bin", 4)]).await?;
        let error = session
            .init_file(&FilePath::new("", "other.bin"))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&error), ErrorKind::IllegalState);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_manifest_entry_is_fatal() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let result = open(tmp.path(), &[("a.bin", 4), ("a.bin", 4)]).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn structure_reflects_destination() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("extra.txt"), "x")?;
        let session = open(tmp.path(), &[("a.bin", 4)]).await?;
        let current = session.structure().await?;
        assert_eq!(current.files.len(), 1);
        assert_eq!(current.files[0].file_path, FilePath::new("", "extra.txt"));
        session
            .delete_files(&[FilePath::new("", "extra.txt")], &[])
            .await?;
        assert!(session.structure().await?.files.is_empty());
        Ok(())
    }
}
