//! Per-chunk file digests
//!
//! A digest pass reads the file once, front to back, and emits one hash value for every chunk
//! produced by [`crate::chunk::plan_chunks`]. Two files whose digests agree on a chunk are assumed
//! to hold the same bytes in that range.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::instrument;

use crate::error::file_deleted_or;
use crate::model::{ChunkDigest, FileDigest, FilePath};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DigestType {
    #[default]
    Crc32,
    Sha256,
    Sha512,
    Blake3,
}

enum ChunkHasher {
    Crc32(crc32fast::Hasher),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl ChunkHasher {
    fn new(digest_type: DigestType) -> Self {
        use sha2::Digest;
        match digest_type {
            DigestType::Crc32 => ChunkHasher::Crc32(crc32fast::Hasher::new()),
            DigestType::Sha256 => ChunkHasher::Sha256(sha2::Sha256::new()),
            DigestType::Sha512 => ChunkHasher::Sha512(sha2::Sha512::new()),
            DigestType::Blake3 => ChunkHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        match self {
            ChunkHasher::Crc32(hasher) => hasher.update(data),
            ChunkHasher::Sha256(hasher) => hasher.update(data),
            ChunkHasher::Sha512(hasher) => hasher.update(data),
            ChunkHasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        use sha2::Digest;
        match self {
            ChunkHasher::Crc32(hasher) => hasher.finalize().to_be_bytes().to_vec(),
            ChunkHasher::Sha256(hasher) => hasher.finalize().to_vec(),
            ChunkHasher::Sha512(hasher) => hasher.finalize().to_vec(),
            ChunkHasher::Blake3(hasher) => hasher.finalize().as_bytes().to_vec(),
        }
    }
}

/// Digests `path` chunk by chunk. Blocking; run it on the blocking pool.
///
/// The size is read from the file itself, not from any snapshot, so a file that changed since it
/// was listed is digested as it is now. A missing file is reported as
/// [`crate::error::TransferError::FileDeleted`].
#[instrument(skip(file_path))]
pub fn compute_file_digest(
    path: &std::path::Path,
    file_path: &FilePath,
    chunk_size: u64,
    digest_type: DigestType,
) -> anyhow::Result<FileDigest> {
    let mut file = std::fs::File::open(path).map_err(|err| file_deleted_or(err, file_path))?;
    let size = file
        .metadata()
        .map_err(|err| file_deleted_or(err, file_path))?
        .len();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut chunks = Vec::new();
    for chunk in crate::chunk::plan_chunks(size, chunk_size) {
        let mut hasher = ChunkHasher::new(digest_type);
        let mut remaining = chunk.size;
        while remaining > 0 {
            let to_read = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let read = file
                .read(&mut buffer[..to_read])
                .with_context(|| format!("failed reading {:?} at chunk {}", path, chunk))?;
            if read == 0 {
                // file shrank while we were reading it, digest what's there
                break;
            }
            hasher.update(&buffer[..read]);
            remaining -= read as u64;
        }
        chunks.push(ChunkDigest {
            chunk,
            digest: hasher.finalize(),
        });
    }
    tracing::debug!("digested {} chunks of {:?}", chunks.len(), path);
    Ok(FileDigest {
        digest_type,
        chunks,
    })
}

/// Async wrapper running [`compute_file_digest`] on tokio's blocking pool.
pub async fn file_digest(
    path: std::path::PathBuf,
    file_path: FilePath,
    chunk_size: u64,
    digest_type: DigestType,
) -> anyhow::Result<FileDigest> {
    tokio::task::spawn_blocking(move || {
        compute_file_digest(&path, &file_path, chunk_size, digest_type)
    })
    .await?
}
