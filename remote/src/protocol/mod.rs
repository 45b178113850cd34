//! Messages exchanged between `dsync` and `dsyncd`
//!
//! Every message is one length-delimited frame encoded with `bitcode`. A connection carries one
//! request at a time: the client sends a [`Request`] and waits for exactly one [`Response`].
//! Two exchanges carry raw bytes after the frame:
//!
//! - [`Request::UploadChunk`] is followed by exactly `chunk.size` bytes of file content
//! - [`Response::Chunk`] is followed by exactly `size` bytes of file content

use common::{
    ChunkInfo, DigestType, DirectoryStructure, ErrorKind, FileDigest, FilePath, TransferError,
    TransferMode, filter::FilterSettings,
};
use serde::{Deserialize, Serialize};

/// Parameters shared by every session-initiating request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionInit {
    pub root_directory: String,
    pub chunk_size: u64,
    pub filter: FilterSettings,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Request {
    InitDownload(SessionInit),
    InitUpload {
        init: SessionInit,
        manifest: DirectoryStructure,
    },
    /// Scan a directory without opening a session.
    List(SessionInit),
    Structure {
        mode: TransferMode,
        session: String,
    },
    FileDigest {
        mode: TransferMode,
        session: String,
        file: FilePath,
        digest_type: DigestType,
    },
    SkipFile {
        mode: TransferMode,
        session: String,
        file: FilePath,
    },
    InitFile {
        mode: TransferMode,
        session: String,
        file: FilePath,
    },
    DownloadChunk {
        file_session: String,
        chunk: ChunkInfo,
    },
    UploadChunk {
        file_session: String,
        chunk: ChunkInfo,
    },
    CommitFile {
        mode: TransferMode,
        file_session: String,
    },
    AbortFile {
        mode: TransferMode,
        file_session: String,
    },
    DeleteFile {
        file_session: String,
    },
    CreateDirectories {
        session: String,
    },
    DeleteFiles {
        session: String,
        files: Vec<FilePath>,
        directories: Vec<FilePath>,
    },
    Commit {
        mode: TransferMode,
        session: String,
    },
    Abort {
        mode: TransferMode,
        session: String,
    },
}

impl Request {
    /// Short operation name, used in logs and in [`ErrorBody::path`].
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Response {
    Ok,
    SessionId(String),
    Structure(DirectoryStructure),
    Digest(FileDigest),
    /// followed by `size` raw bytes
    Chunk {
        size: u64,
    },
    Error(ErrorBody),
}

impl Response {
    fn unexpected(self, expected: &str) -> anyhow::Error {
        anyhow::anyhow!("expected {} response, got {:?}", expected, self)
    }

    pub fn into_ok(self) -> anyhow::Result<()> {
        match self {
            Response::Ok => Ok(()),
            other => Err(other.unexpected("Ok")),
        }
    }

    pub fn into_session_id(self) -> anyhow::Result<String> {
        match self {
            Response::SessionId(id) => Ok(id),
            other => Err(other.unexpected("SessionId")),
        }
    }

    pub fn into_structure(self) -> anyhow::Result<DirectoryStructure> {
        match self {
            Response::Structure(structure) => Ok(structure),
            other => Err(other.unexpected("Structure")),
        }
    }

    pub fn into_digest(self) -> anyhow::Result<FileDigest> {
        match self {
            Response::Digest(digest) => Ok(digest),
            other => Err(other.unexpected("Digest")),
        }
    }
}

pub const ERROR_STATUS: u16 = 500;
pub const ERROR_TITLE: &str = "Server Exception";

/// Structured description of a failed request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorBody {
    /// milliseconds since the unix epoch
    pub timestamp: i64,
    pub status: u16,
    pub error: String,
    pub message: String,
    /// operation that failed
    pub path: String,
    pub kind: ErrorKind,
}

impl ErrorBody {
    #[must_use]
    pub fn new(kind: ErrorKind, message: String, path: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            status: ERROR_STATUS,
            error: ERROR_TITLE.to_string(),
            message,
            path: path.to_string(),
            kind,
        }
    }

    #[must_use]
    pub fn from_error(error: &anyhow::Error, path: &str) -> Self {
        Self::new(common::error::error_kind(error), format!("{error:#}"), path)
    }

    #[must_use]
    pub fn into_error(self) -> TransferError {
        TransferError::Remote {
            kind: self.kind,
            message: self.message,
        }
    }
}
