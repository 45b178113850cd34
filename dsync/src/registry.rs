//! Registry of active sessions
//!
//! The registry is the only place sessions are created and dropped. Two sessions never cover
//! overlapping directories: a new session is refused if its root equals, contains or is contained
//! in the root of any active (or still initializing) session.

use common::filter::FilterSettings;
use common::{DirectoryStructure, TransferError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

use crate::auth::Authenticator;
use crate::session::download::{DownloadSession, FileDownloadSession};
use crate::session::upload::{FileUploadSession, UploadSession};
use crate::session::{new_session_id, parent_session_id};

pub const DEFAULT_MAX_INACTIVITY: std::time::Duration = std::time::Duration::from_secs(150);
pub const DEFAULT_MAX_OPEN_HANDLES: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// sessions idle for longer than this are aborted by the expiry sweep
    pub max_inactivity: std::time::Duration,
    /// per file session
    pub max_open_handles: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_inactivity: DEFAULT_MAX_INACTIVITY,
            max_open_handles: DEFAULT_MAX_OPEN_HANDLES,
        }
    }
}

#[derive(Default)]
struct Sessions {
    download: HashMap<String, Arc<DownloadSession>>,
    upload: HashMap<String, Arc<UploadSession>>,
    /// roots reserved by sessions whose initial scan is still running
    initializing: HashMap<String, std::path::PathBuf>,
}

impl Sessions {
    fn roots(&self) -> impl Iterator<Item = &std::path::Path> {
        self.download
            .values()
            .map(|session| session.root())
            .chain(self.upload.values().map(|session| session.root()))
            .chain(self.initializing.values().map(|root| root.as_path()))
    }
}

/// Counters reported when `dsyncd` shuts down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub download_sessions: u64,
    pub upload_sessions: u64,
    pub committed: u64,
    pub aborted: u64,
    pub expired: u64,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "download sessions: {}\n\
            upload sessions: {}\n\
            committed: {}\n\
            aborted: {}\n\
            expired: {}\n",
            self.download_sessions, self.upload_sessions, self.committed, self.aborted, self.expired,
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    download_sessions: AtomicU64,
    upload_sessions: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    expired: AtomicU64,
}

pub struct SessionRegistry {
    auth: Authenticator,
    config: RegistryConfig,
    sessions: std::sync::Mutex<Sessions>,
    counters: Counters,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .finish()
    }
}

/// True if one path is an ancestor of (or equal to) the other.
#[must_use]
pub fn paths_overlap(first: &std::path::Path, second: &std::path::Path) -> bool {
    first.starts_with(second) || second.starts_with(first)
}

/// Absolute form of `path` with `.` and `..` resolved lexically, without touching the filesystem.
pub fn normalize_root(
    path: impl AsRef<std::path::Path>,
) -> std::io::Result<std::path::PathBuf> {
    let mut normalized = std::path::PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Holds a root in [`Sessions::initializing`] until dropped.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.sessions().initializing.remove(&self.id);
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(auth: Authenticator, config: RegistryConfig) -> Self {
        Self {
            auth,
            config,
            sessions: std::sync::Mutex::new(Sessions::default()),
            counters: Counters::default(),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, Sessions> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Authenticates the caller, checks `root` against active sessions and reserves it.
    fn reserve(
        &self,
        root_directory: &str,
        chunk_size: u64,
        auth_token: Option<&str>,
    ) -> anyhow::Result<(Reservation<'_>, std::path::PathBuf)> {
        self.auth.authenticate(auth_token)?;
        if chunk_size == 0 {
            return Err(anyhow::anyhow!("chunk size must be positive"));
        }
        let root = normalize_root(root_directory).map_err(|err| {
            anyhow::Error::from(err).context(format!("invalid root directory {root_directory:?}"))
        })?;
        let mut sessions = self.sessions();
        if let Some(active) = sessions.roots().find(|active| paths_overlap(&root, active)) {
            return Err(TransferError::OverlappingRoot {
                requested: root.clone(),
                active: active.to_path_buf(),
            }
            .into());
        }
        let id = new_session_id();
        sessions.initializing.insert(id.clone(), root.clone());
        Ok((Reservation { registry: self, id }, root))
    }

    #[instrument(skip(self, filter, auth_token))]
    pub async fn init_download(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
        auth_token: Option<&str>,
    ) -> anyhow::Result<String> {
        let (reservation, root) = self.reserve(root_directory, chunk_size, auth_token)?;
        let session = DownloadSession::new(
            reservation.id.clone(),
            root,
            chunk_size,
            filter,
            self.config.max_open_handles,
        )
        .await?;
        let id = reservation.id.clone();
        self.sessions()
            .download
            .insert(id.clone(), Arc::new(session));
        drop(reservation);
        self.counters.download_sessions.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    #[instrument(skip(self, filter, manifest, auth_token))]
    pub async fn init_upload(
        &self,
        root_directory: &str,
        chunk_size: u64,
        filter: &FilterSettings,
        manifest: DirectoryStructure,
        auth_token: Option<&str>,
    ) -> anyhow::Result<String> {
        let (reservation, root) = self.reserve(root_directory, chunk_size, auth_token)?;
        let session = UploadSession::new(
            reservation.id.clone(),
            root,
            chunk_size,
            filter,
            manifest,
            self.config.max_open_handles,
        )
        .await?;
        let id = reservation.id.clone();
        self.sessions().upload.insert(id.clone(), Arc::new(session));
        drop(reservation);
        self.counters.upload_sessions.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    pub fn download(&self, id: &str) -> Result<Arc<DownloadSession>, TransferError> {
        self.sessions()
            .download
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotExists(id.to_string()))
    }

    pub fn upload(&self, id: &str) -> Result<Arc<UploadSession>, TransferError> {
        self.sessions()
            .upload
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotExists(id.to_string()))
    }

    pub fn file_download(&self, file_session: &str) -> Result<Arc<FileDownloadSession>, TransferError> {
        self.download(parent_session_id(file_session)?)?
            .file_session(file_session)
    }

    pub fn file_upload(&self, file_session: &str) -> Result<Arc<FileUploadSession>, TransferError> {
        self.upload(parent_session_id(file_session)?)?
            .file_session(file_session)
    }

    /// Commits and forgets the session. Once gone, its id is unknown to the registry.
    pub fn commit_download(&self, id: &str) -> Result<(), TransferError> {
        let mut sessions = self.sessions();
        let session = sessions
            .download
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotExists(id.to_string()))?;
        session.commit()?;
        tracing::info!("download session completed, dir: {:?}", session.root());
        sessions.download.remove(id);
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn commit_upload(&self, id: &str) -> Result<(), TransferError> {
        let mut sessions = self.sessions();
        let session = sessions
            .upload
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotExists(id.to_string()))?;
        session.commit()?;
        tracing::info!("upload session completed, dir: {:?}", session.root());
        sessions.upload.remove(id);
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Aborting a session that no longer exists is a no-op.
    pub fn abort_download(&self, id: &str) {
        if let Some(session) = self.sessions().download.remove(id) {
            session.abort();
            tracing::info!("download session aborted, dir: {:?}", session.root());
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn abort_upload(&self, id: &str) {
        if let Some(session) = self.sessions().upload.remove(id) {
            session.abort();
            tracing::info!("upload session aborted, dir: {:?}", session.root());
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Aborts and removes every session idle for longer than the configured limit.
    pub fn expire_inactive_sessions(&self) -> usize {
        let max_inactivity = self.config.max_inactivity;
        let mut sessions = self.sessions();
        tracing::trace!("checking for inactive sessions");
        let expired_downloads: Vec<String> = sessions
            .download
            .iter()
            .filter(|(_, session)| session.idle_for() > max_inactivity)
            .map(|(id, _)| id.clone())
            .collect();
        let expired_uploads: Vec<String> = sessions
            .upload
            .iter()
            .filter(|(_, session)| session.idle_for() > max_inactivity)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired_downloads {
            if let Some(session) = sessions.download.remove(id) {
                tracing::warn!(
                    "expiring download session {} over {:?}, idle for {:?}",
                    id,
                    session.root(),
                    session.idle_for()
                );
                session.abort();
            }
        }
        for id in &expired_uploads {
            if let Some(session) = sessions.upload.remove(id) {
                tracing::warn!(
                    "expiring upload session {} over {:?}, idle for {:?}",
                    id,
                    session.root(),
                    session.idle_for()
                );
                session.abort();
            }
        }
        let expired = expired_downloads.len() + expired_uploads.len();
        self.counters
            .expired
            .fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Calls [`Self::expire_inactive_sessions`] every `interval`, forever.
    pub async fn run_expiry(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.expire_inactive_sessions();
        }
    }

    /// Scans `root_directory` without opening a session.
    #[instrument(skip(self, filter, auth_token))]
    pub async fn list(
        &self,
        root_directory: &str,
        filter: &FilterSettings,
        auth_token: Option<&str>,
    ) -> anyhow::Result<DirectoryStructure> {
        self.auth.authenticate(auth_token)?;
        common::scan::read_directory_structure(std::path::Path::new(root_directory), filter).await
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        let sessions = self.sessions();
        sessions.download.len() + sessions.upload.len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RegistryStats {
            download_sessions: get(&self.counters.download_sessions),
            upload_sessions: get(&self.counters.upload_sessions),
            committed: get(&self.counters.committed),
            aborted: get(&self.counters.aborted),
            expired: get(&self.counters.expired),
        }
    }
}
