//! Data model shared by both sides of a transfer
//!
//! Every entry below a synchronized root is addressed by a [`FilePath`]: the directory it lives in,
//! relative to the root, and its own name. Paths always use `/` as separator on the wire so that a
//! snapshot taken on one host can be resolved against a root on another.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TransferError;

/// Location of a file or directory relative to a synchronized root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilePath {
    /// directory containing the entry, empty for entries directly under the root
    pub relative_directory: String,
    pub file_name: String,
}

impl FilePath {
    pub fn new(relative_directory: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            relative_directory: relative_directory.into(),
            file_name: file_name.into(),
        }
    }

    /// Path relative to the root, e.g. `sub/dir/file.txt`.
    #[must_use]
    pub fn to_relative_path(&self) -> std::path::PathBuf {
        let mut path = std::path::PathBuf::new();
        for component in self.relative_directory.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path.push(&self.file_name);
        path
    }

    /// Joins this path onto `root`.
    #[must_use]
    pub fn resolve(&self, root: &std::path::Path) -> std::path::PathBuf {
        root.join(self.to_relative_path())
    }

    /// Relative path of an entry located directly inside this one.
    #[must_use]
    pub fn child(&self, name: &str) -> FilePath {
        let relative_directory = if self.relative_directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.relative_directory, self.file_name)
        };
        FilePath::new(relative_directory, name)
    }
}

impl std::fmt::Display for FilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.relative_directory.is_empty() {
            write!(f, "{}", self.file_name)
        } else {
            write!(f, "{}/{}", self.relative_directory, self.file_name)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_path: FilePath,
    pub size: u64,
    /// modification time in milliseconds since the unix epoch
    pub last_modified: i64,
    /// POSIX permission bits, absent where the filesystem doesn't report them
    pub permissions: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMetadata {
    pub file_path: FilePath,
    pub permissions: Option<u32>,
}

/// Snapshot of a directory tree taken once and never mutated afterwards.
///
/// Directories are ordered so that every directory comes before its children, which lets a
/// receiver create them in a single pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStructure {
    pub root_directory: String,
    pub directories: Vec<DirectoryMetadata>,
    pub files: Vec<FileMetadata>,
}

impl DirectoryStructure {
    /// Index of the files by path; a path listed twice is fatal.
    pub fn files_by_path(&self) -> Result<HashMap<FilePath, FileMetadata>, TransferError> {
        let mut files = HashMap::with_capacity(self.files.len());
        for metadata in &self.files {
            if files
                .insert(metadata.file_path.clone(), metadata.clone())
                .is_some()
            {
                return Err(TransferError::DuplicatePath(metadata.file_path.clone()));
            }
        }
        Ok(files)
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Contiguous byte range of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub offset: u64,
    pub size: u64,
}

impl ChunkInfo {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

impl std::fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDigest {
    pub chunk: ChunkInfo,
    pub digest: Vec<u8>,
}

/// Per-chunk digests of one file, in chunk order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub digest_type: crate::digest::DigestType,
    pub chunks: Vec<ChunkDigest>,
}

impl FileDigest {
    #[must_use]
    pub fn by_chunk(&self) -> HashMap<ChunkInfo, Vec<u8>> {
        self.chunks
            .iter()
            .map(|chunk_digest| (chunk_digest.chunk, chunk_digest.digest.clone()))
            .collect()
    }
}

/// Direction of a transfer as seen from the client.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TransferMode {
    Upload,
    Download,
}
