//! Per-file transfer decision and chunk selection
//!
//! For every source file the executor asks [`decide`] what to do with it, then [`plan_transfer`]
//! turns a decision into the list of chunks that actually have to move.

use common::chunk::plan_chunks;
use common::{ChunkInfo, FileDigest, FileIntegrityOptions, FileMetadata, IntegrityCheck};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferDecision {
    /// Destination already matches the source.
    SkipTransfer,
    /// Contents match, permissions don't.
    OnlySetMetadata,
    /// Destination doesn't exist; every chunk moves.
    TransferFully,
    /// Destination exists but differs. With both digests present only chunks whose digests
    /// differ move; without them every chunk moves.
    TransferPartially {
        source: Option<FileDigest>,
        destination: Option<FileDigest>,
    },
}

/// Same size and the destination is not older than the source.
#[must_use]
pub fn metadata_ok(source: &FileMetadata, destination: &FileMetadata) -> bool {
    source.size == destination.size && source.last_modified <= destination.last_modified
}

/// Both sides know their permissions and they differ.
#[must_use]
pub fn needs_permission_fix(source: &FileMetadata, destination: &FileMetadata) -> bool {
    match (source.permissions, destination.permissions) {
        (Some(source), Some(destination)) => source != destination,
        _ => false,
    }
}

/// Decides how `source` should reach the destination.
///
/// The digest futures are only polled when `integrity` asks for digests, and then concurrently.
pub async fn decide<S, D>(
    source: &FileMetadata,
    destination: Option<&FileMetadata>,
    integrity: FileIntegrityOptions,
    source_digest: S,
    destination_digest: D,
) -> anyhow::Result<TransferDecision>
where
    S: std::future::Future<Output = anyhow::Result<FileDigest>>,
    D: std::future::Future<Output = anyhow::Result<FileDigest>>,
{
    let Some(destination) = destination else {
        return Ok(TransferDecision::TransferFully);
    };
    let metadata_ok = metadata_ok(source, destination);
    let unchanged = if needs_permission_fix(source, destination) {
        TransferDecision::OnlySetMetadata
    } else {
        TransferDecision::SkipTransfer
    };
    let decision = match integrity.check {
        IntegrityCheck::OnlyFileMetadata => {
            if metadata_ok {
                unchanged
            } else {
                TransferDecision::TransferPartially {
                    source: None,
                    destination: None,
                }
            }
        }
        IntegrityCheck::FileMetadataAndDigest => {
            let (source_digest, destination_digest) =
                tokio::try_join!(source_digest, destination_digest)?;
            if metadata_ok && source_digest == destination_digest {
                unchanged
            } else {
                TransferDecision::TransferPartially {
                    source: Some(source_digest),
                    destination: Some(destination_digest),
                }
            }
        }
    };
    tracing::debug!("{}: {:?}", source.file_path, DecisionKind::from(&decision));
    Ok(decision)
}

/// Decision without the digests, for logging.
#[derive(Debug)]
enum DecisionKind {
    SkipTransfer,
    OnlySetMetadata,
    TransferFully,
    TransferPartially,
}

impl From<&TransferDecision> for DecisionKind {
    fn from(decision: &TransferDecision) -> Self {
        match decision {
            TransferDecision::SkipTransfer => DecisionKind::SkipTransfer,
            TransferDecision::OnlySetMetadata => DecisionKind::OnlySetMetadata,
            TransferDecision::TransferFully => DecisionKind::TransferFully,
            TransferDecision::TransferPartially { .. } => DecisionKind::TransferPartially,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    pub transfer: Vec<ChunkInfo>,
    pub skipped: Vec<ChunkInfo>,
}

/// Splits a file of `size` bytes into chunks and picks those that have to move.
///
/// A chunk is skipped only if both digests carry it with the same value.
#[must_use]
pub fn plan_transfer(size: u64, chunk_size: u64, decision: &TransferDecision) -> ChunkPlan {
    let chunks = plan_chunks(size, chunk_size);
    match decision {
        TransferDecision::TransferPartially {
            source: Some(source),
            destination: Some(destination),
        } => {
            let source = source.by_chunk();
            let destination = destination.by_chunk();
            let (skipped, transfer) = chunks.into_iter().partition(|chunk| {
                matches!(
                    (source.get(chunk), destination.get(chunk)),
                    (Some(source), Some(destination)) if source == destination
                )
            });
            ChunkPlan { transfer, skipped }
        }
        _ => ChunkPlan {
            transfer: chunks,
            skipped: vec![],
        },
    }
}
