//! Download session: the server is the source
//!
//! The directory is scanned once when the session is opened. Files are checked against that
//! snapshot on every request, but the snapshot may be stale: a file deleted after the scan is
//! only noticed on actual I/O and reported as [`TransferError::FileDeleted`].

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
    file_sessions: HashMap<String, Arc<FileDownloadSession>>,
}

pub struct DownloadSession {
    id: String,
    root: std::path::PathBuf,
    chunk_size: u64,
    max_open_handles: usize,
    structure: DirectoryStructure,
    files: HashMap<FilePath, FileMetadata>,
    activity: Activity,
    state: std::sync::Mutex<State>,
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl DownloadSession {
    /// Scans `root` and opens a session over what was found.
    #[instrument(skip(filter))]
    pub async fn new(
        id: String,
        root: std::path::PathBuf,
        chunk_size: u64,
        filter: &FilterSettings,
        max_open_handles: usize,
    ) -> anyhow::Result<Self> {
        let structure = common::scan::read_directory_structure(&root, filter).await?;
        let files = structure.files_by_path()?;
        tracing::info!(
            "download session {} over {:?}: {} files, {} directories",
            id,
            root,
            structure.files.len(),
            structure.directories.len()
        );
        Ok(Self {
            id,
            root,
            chunk_size,
            max_open_handles,
            structure,
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

    pub fn structure(&self) -> DirectoryStructure {
        self.activity.touch();
        self.structure.clone()
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

    /// Opens a read-only pool over `file` and returns the new file-session id.
    pub fn init_file(&self, file: &FilePath) -> Result<String, TransferError> {
        self.activity.touch();
        let metadata = self.registered(file)?.clone();
        let mut state = self.state();
        if state.phase != Phase::Active {
            return Err(TransferError::AlreadyCommitted(self.id.clone()));
        }
        let id = super::new_file_session_id(&self.id);
        let pool = RandomAccessFilePool::new(
            file.resolve(&self.root),
            file.clone(),
            AccessMode::ReadOnly,
            self.max_open_handles,
        );
        state.file_sessions.insert(
            id.clone(),
            Arc::new(FileDownloadSession {
                id: id.clone(),
                chunk_size: self.chunk_size,
                metadata,
                pool,
                committed: AtomicBool::new(false),
            }),
        );
        tracing::debug!("session {}: opened file session {} for {}", self.id, id, file);
        Ok(id)
    }

    pub fn file_session(&self, id: &str) -> Result<Arc<FileDownloadSession>, TransferError> {
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
        tracing::info!("download session {} committed", self.id);
        Ok(())
    }

    /// Terminates the session, interrupting chunk reads still in flight.
    pub fn abort(&self) {
        let mut state = self.state();
        state.phase = Phase::Aborted;
        for file_session in state.file_sessions.values() {
            file_session.abort();
        }
        tracing::info!("download session {} aborted", self.id);
    }
}

#[derive(Debug)]
pub struct FileDownloadSession {
    id: String,
    chunk_size: u64,
    metadata: FileMetadata,
    pool: Arc<RandomAccessFilePool>,
    committed: AtomicBool,
}

impl FileDownloadSession {
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

    pub fn check_chunk(&self, chunk: ChunkInfo) -> Result<(), TransferError> {
        common::chunk::check_bounds(chunk, self.chunk_size, self.metadata.size)
    }

    pub async fn download_chunk(&self, chunk: ChunkInfo) -> anyhow::Result<Bytes> {
        self.check_not_committed()?;
        self.check_chunk(chunk)?;
        let mut lease = self.pool.borrow().await?;
        let data = lease.read_chunk(chunk).await?;
        Ok(Bytes::from(data))
    }

    pub fn commit(&self) -> Result<(), TransferError> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Err(TransferError::AlreadyCommitted(self.id.clone()));
        }
        self.pool.close();
        Ok(())
    }

    pub fn abort(&self) {
        self.pool.force_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ErrorKind;
    use common::error::error_kind;

    async fn open(root: &std::path::Path) -> anyhow::Result<DownloadSession> {
        DownloadSession::new(
            "s1".to_string(),
            root.to_path_buf(),
            4,
            &FilterSettings::new(),
            8,
        )
        .await
    }

    #[tokio::test]
    async fn serves_chunks_of_registered_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("a.txt"), "0123456789")?;
        let session = open(tmp.path()).await?;
        assert_eq!(session.structure().files.len(), 1);
        let file = FilePath::new("", "a.txt");
        let id = session.init_file(&file)?;
        assert!(id.starts_with("s1_"));
        let file_session = session.file_session(&id)?;
        let data = file_session
            .download_chunk(ChunkInfo { offset: 8, size: 2 })
            .await?;
        assert_eq!(&data[..], b"89");
        let digest = session.file_digest(&file, DigestType::Crc32).await?;
        assert_eq!(digest.chunks.len(), 3);
        file_session.commit()?;
        assert!(matches!(
            file_session.commit(),
            Err(TransferError::AlreadyCommitted(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn chunks_outside_the_file_are_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("a.txt"), "0123456789")?;
        let session = open(tmp.path()).await?;
        let file_session = session.file_session(&session.init_file(&FilePath::new("", "a.txt"))?)?;
        for chunk in [
            ChunkInfo { offset: 8, size: 4 },
            ChunkInfo { offset: 0, size: 1 << 62 },
        ] {
            let error = file_session.download_chunk(chunk).await.unwrap_err();
            assert!(matches!(
                error.downcast_ref::<TransferError>(),
                Some(TransferError::ChunkOutOfBounds { .. })
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_file_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path()).await?;
        let file = FilePath::new("", "late.txt");
        std::fs::write(file.resolve(tmp.path()), "x")?;
        assert!(matches!(
            session.skip_file(&file),
            Err(TransferError::FileNotSpecified { .. })
        ));
        assert!(session.init_file(&file).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn file_deleted_after_scan() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("gone.txt"), "data")?;
        let session = open(tmp.path()).await?;
        std::fs::remove_file(tmp.path().join("gone.txt"))?;
        let file = FilePath::new("", "gone.txt");
        let digest_error = session
            .file_digest(&file, DigestType::Crc32)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&digest_error), ErrorKind::FileDeleted);
        let file_session = session.file_session(&session.init_file(&file)?)?;
        let chunk_error = file_session
            .download_chunk(ChunkInfo { offset: 0, size: 4 })
            .await
            .unwrap_err();
        assert_eq!(error_kind(&chunk_error), ErrorKind::FileDeleted);
        Ok(())
    }

    #[tokio::test]
    async fn commit_and_abort_are_terminal() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("a.txt"), "abcd")?;
        let session = open(tmp.path()).await?;
        let file_session = session.file_session(&session.init_file(&FilePath::new("", "a.txt"))?)?;
        session.abort();
        assert_eq!(session.phase(), Phase::Aborted);
        let error = file_session
            .download_chunk(ChunkInfo { offset: 0, size: 4 })
            .await
            .unwrap_err();
        assert_eq!(error_kind(&error), ErrorKind::IllegalState);
        assert!(matches!(
            session.commit(),
            Err(TransferError::AlreadyCommitted(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn session_commits_once() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path()).await?;
        session.commit()?;
        assert_eq!(session.phase(), Phase::Committed);
        assert!(session.commit().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_file_session() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = open(tmp.path()).await?;
        assert!(matches!(
            session.file_session("s1_nope"),
            Err(TransferError::SessionNotExists(_))
        ));
        Ok(())
    }
}
