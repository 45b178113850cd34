//! Client-side orchestration of a transfer
//!
//! Both executors follow the same plan:
//!
//! 1. open a remote session and take snapshots of both sides
//! 2. create the destination directories
//! 3. optionally remove destination entries the source doesn't have
//! 4. sync files smaller than `chunk_size * num_connections` concurrently, at most
//!    `num_connections` at a time, and wait for all of them
//! 5. sync the remaining big files one after another
//! 6. commit the remote session
//!
//! Chunk transfers of all files share one limit of `num_connections` chunks in flight. If a chunk
//! transfer finds its source file gone, the file's remaining chunks are cancelled and the file is
//! reported as deleted; any other failure aborts the whole transfer.

pub mod download;
pub mod upload;

use common::progress::Summary;
use common::{ChunkInfo, FileMetadata, TransferOptions};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Failed transfer together with what had been done until it failed.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

type AbortAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Holds the action aborting the remote session of a running transfer.
///
/// The executor registers the action as soon as the session exists and clears it after the
/// session is committed. Whoever fires the hook first (the executor on failure or a signal
/// handler) runs the action; later calls do nothing.
#[derive(Default)]
pub struct AbortHook {
    action: std::sync::Mutex<Option<AbortAction>>,
}

impl std::fmt::Debug for AbortHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHook")
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl AbortHook {
    fn action(&self) -> std::sync::MutexGuard<'_, Option<AbortAction>> {
        self.action
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn register<F>(&self, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        *self.action() = Some(Box::new(action));
    }

    pub fn clear(&self) {
        self.action().take();
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.action().is_some()
    }

    /// Runs the registered action, if any. Errors are logged, not returned.
    pub async fn fire(&self) -> bool {
        let Some(action) = self.action().take() else {
            return false;
        };
        tracing::info!("aborting remote session");
        if let Err(error) = action().await {
            tracing::warn!("failed aborting remote session: {:#}", error);
        }
        true
    }
}

/// Syncs small files concurrently and then big files one by one.
pub(crate) async fn for_each_file<F, Fut>(
    files: &[FileMetadata],
    options: &TransferOptions,
    sync_file: F,
) -> anyhow::Result<()>
where
    F: Fn(FileMetadata) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let classified =
        common::chunk::classify_by_size(files, options.chunk_size, options.num_connections);
    tracing::debug!(
        "{} small files, {} big files",
        classified.small.len(),
        classified.big.len()
    );
    let file_slots = Arc::new(tokio::sync::Semaphore::new(options.num_connections));
    let mut join_set = tokio::task::JoinSet::new();
    for file in classified.small {
        let slots = file_slots.clone();
        let task = sync_file(file);
        join_set.spawn(async move {
            let _permit = slots.acquire_owned().await?;
            task.await
        });
    }
    while let Some(result) = join_set.join_next().await {
        // dropping the join set on error cancels the remaining files
        result??;
    }
    for file in classified.big {
        sync_file(file).await?;
    }
    Ok(())
}

/// Runs `transfer` for every chunk, bounded by `chunk_slots` and the ops throttle.
///
/// On the first failure the remaining chunk tasks are cancelled and awaited before the error is
/// returned, so no chunk I/O is running on the file anymore.
pub(crate) async fn transfer_chunks<F, Fut>(
    chunks: Vec<ChunkInfo>,
    chunk_slots: &Arc<tokio::sync::Semaphore>,
    transfer: F,
) -> anyhow::Result<()>
where
    F: Fn(ChunkInfo) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut join_set = tokio::task::JoinSet::new();
    for chunk in chunks {
        let slots = chunk_slots.clone();
        let task = transfer(chunk);
        join_set.spawn(async move {
            let _permit = slots.acquire_owned().await?;
            throttle::get_ops_token().await;
            task.await
        });
    }
    while let Some(result) = join_set.join_next().await {
        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(join_error) => anyhow::Error::from(join_error),
        };
        join_set.shutdown().await;
        return Err(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn hook_fires_once() -> anyhow::Result<()> {
        let hook = AbortHook::default();
        assert!(!hook.fire().await);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        hook.register(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("remote is gone"))
            })
        });
        assert!(hook.is_armed());
        assert!(hook.fire().await);
        assert!(!hook.fire().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cleared_hook_does_nothing() {
        let hook = AbortHook::default();
        hook.register(|| Box::pin(async { Ok(()) }));
        hook.clear();
        assert!(!hook.fire().await);
    }

    #[tokio::test]
    async fn chunk_concurrency_is_bounded() -> anyhow::Result<()> {
        let slots = Arc::new(tokio::sync::Semaphore::new(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let chunks = common::chunk::plan_chunks(100, 5);
        transfer_chunks(chunks, &slots, |_chunk| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn first_chunk_failure_cancels_the_rest() {
        let slots = Arc::new(tokio::sync::Semaphore::new(1));
        let completed = Arc::new(AtomicUsize::new(0));
        let chunks = common::chunk::plan_chunks(50, 10);
        let result = transfer_chunks(chunks, &slots, |chunk| {
            let completed = completed.clone();
            async move {
                if chunk.offset == 0 {
                    anyhow::bail!("broken chunk");
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }
}
