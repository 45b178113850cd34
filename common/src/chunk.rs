use crate::error::TransferError;
use crate::model::{ChunkInfo, FileMetadata};

/// Splits `[0, size)` into consecutive chunks of `chunk_size` bytes; only the last one may be
/// shorter. An empty file has no chunks.
#[must_use]
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    assert!(chunk_size > 0, "chunk size must be positive");
    (0..size)
        .step_by(usize::try_from(chunk_size).unwrap_or(usize::MAX))
        .map(|offset| ChunkInfo {
            offset,
            size: chunk_size.min(size - offset),
        })
        .collect()
}

/// Accepts a chunk requested by a peer only if it fits within one chunk of the session and lies
/// inside the file.
pub fn check_bounds(
    chunk: ChunkInfo,
    chunk_size: u64,
    file_size: u64,
) -> Result<(), TransferError> {
    let inside_file = chunk
        .offset
        .checked_add(chunk.size)
        .is_some_and(|end| end <= file_size);
    if chunk.size > chunk_size || !inside_file {
        return Err(TransferError::ChunkOutOfBounds {
            chunk,
            chunk_size,
            file_size,
        });
    }
    Ok(())
}

/// Files split by whether file-level or chunk-level parallelism should be applied to them.
#[derive(Debug, Default)]
pub struct SizeClassifiedFiles {
    pub small: Vec<FileMetadata>,
    pub big: Vec<FileMetadata>,
}

/// A file is small if it can't keep all connections busy on its own.
#[must_use]
pub fn classify_by_size(
    files: &[FileMetadata],
    chunk_size: u64,
    num_connections: usize,
) -> SizeClassifiedFiles {
    let threshold = chunk_size.saturating_mul(num_connections as u64);
    let (small, big) = files
        .iter()
        .cloned()
        .partition(|file| file.size < threshold);
    SizeClassifiedFiles { small, big }
}
