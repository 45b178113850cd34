//! Error taxonomy for sessions, pools and transfers
//!
//! Errors are propagated as `anyhow::Error` with a [`TransferError`] somewhere in the chain. Callers
//! that need to tell the recoverable "source deleted" case apart from fatal errors use
//! [`error_kind`], which walks the chain.

use serde::{Deserialize, Serialize};

use crate::model::FilePath;

/// Coarse classification carried over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    FileDeleted,
    IllegalState,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file deleted concurrently: {0}")]
    FileDeleted(FilePath),
    #[error("session does not exist: {0}")]
    SessionNotExists(String),
    #[error("already committed: {0}")]
    AlreadyCommitted(String),
    #[error("file {path} is not specified in session {session}")]
    FileNotSpecified { path: FilePath, session: String },
    #[error("root directory {requested:?} overlaps with root {active:?} of active session")]
    OverlappingRoot {
        requested: std::path::PathBuf,
        active: std::path::PathBuf,
    },
    #[error("file path {0} is listed more than once")]
    DuplicatePath(FilePath),
    #[error("chunk {chunk} declared {declared} bytes but {actual} bytes were received")]
    InputStreamSizeMismatch {
        chunk: crate::model::ChunkInfo,
        declared: u64,
        actual: u64,
    },
    #[error("chunk {chunk} is out of bounds (chunk size {chunk_size}, file size {file_size})")]
    ChunkOutOfBounds {
        chunk: crate::model::ChunkInfo,
        chunk_size: u64,
        file_size: u64,
    },
    #[error("not a directory: {0:?}")]
    NotDirectory(std::path::PathBuf),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("file pool for {0:?} is closed")]
    PoolClosed(std::path::PathBuf),
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl TransferError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::FileDeleted(_) => ErrorKind::FileDeleted,
            TransferError::SessionNotExists(_)
            | TransferError::AlreadyCommitted(_)
            | TransferError::FileNotSpecified { .. }
            | TransferError::OverlappingRoot { .. }
            | TransferError::DuplicatePath(_)
            | TransferError::InputStreamSizeMismatch { .. }
            | TransferError::ChunkOutOfBounds { .. }
            | TransferError::PoolClosed(_) => ErrorKind::IllegalState,
            TransferError::NotDirectory(_) | TransferError::Authentication(_) => ErrorKind::Unknown,
            TransferError::Remote { kind, .. } => *kind,
        }
    }
}

/// Finds the first [`TransferError`] in the chain and reports its kind.
#[must_use]
pub fn error_kind(error: &anyhow::Error) -> ErrorKind {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<TransferError>())
        .map_or(ErrorKind::Unknown, TransferError::kind)
}

/// Maps "not found" I/O errors on a source file to [`TransferError::FileDeleted`].
pub fn file_deleted_or(error: std::io::Error, path: &FilePath) -> anyhow::Error {
    if error.kind() == std::io::ErrorKind::NotFound {
        TransferError::FileDeleted(path.clone()).into()
    } else {
        anyhow::Error::from(error)
    }
}
