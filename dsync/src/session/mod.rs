//! Server-side state of in-progress transfers
//!
//! A session covers one root directory for the lifetime of one `dsync` run. Per-file work happens
//! in file sessions whose ids embed the id of their owning session (`{session}_{uuid}`), so a
//! file-session id alone is enough to find the session it belongs to.

pub mod download;
pub mod upload;

use common::TransferError;

/// Lifecycle of a session. Both terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Active,
    Committed,
    Aborted,
}

/// Last time a client touched a session.
///
/// Backed by the tokio clock so that expiry can be tested with a paused runtime.
#[derive(Debug)]
pub struct Activity(std::sync::Mutex<tokio::time::Instant>);

impl Default for Activity {
    fn default() -> Self {
        Self(std::sync::Mutex::new(tokio::time::Instant::now()))
    }
}

impl Activity {
    fn last(&self) -> std::sync::MutexGuard<'_, tokio::time::Instant> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn touch(&self) {
        *self.last() = tokio::time::Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last().elapsed()
    }
}

#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[must_use]
pub fn new_file_session_id(session: &str) -> String {
    format!("{}_{}", session, uuid::Uuid::new_v4())
}

/// Extracts the owning session id from a file-session id.
pub fn parent_session_id(file_session: &str) -> Result<&str, TransferError> {
    match file_session.split_once('_') {
        Some((session, _)) if !session.is_empty() => Ok(session),
        _ => Err(TransferError::SessionNotExists(file_session.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_session_id_points_back_to_session() -> anyhow::Result<()> {
        let session = new_session_id();
        assert!(!session.contains('_'));
        let file_session = new_file_session_id(&session);
        assert_eq!(parent_session_id(&file_session)?, session);
        Ok(())
    }

    #[test]
    fn malformed_file_session_ids() {
        assert!(matches!(
            parent_session_id("no-separator"),
            Err(TransferError::SessionNotExists(_))
        ));
        assert!(parent_session_id("_leading").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_tracks_idle_time() {
        let activity = Activity::default();
        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        assert!(activity.idle_for() >= std::time::Duration::from_secs(30));
        activity.touch();
        assert!(activity.idle_for() < std::time::Duration::from_secs(1));
    }
}
