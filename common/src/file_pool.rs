//! Pool of reusable open handles to a single file
//!
//! Many chunk transfers address the same file at once. Rather than opening and closing the file
//! for every chunk, workers [`borrow`](RandomAccessFilePool::borrow) a [`FileLease`], seek to
//! their range and do their I/O. Dropping the lease hands the descriptor back to the pool; only the
//! pool ever closes descriptors.
//!
//! [`close`](RandomAccessFilePool::close) drops the idle handles and refuses new borrows.
//! [`force_close`](RandomAccessFilePool::force_close) additionally interrupts I/O running on
//! leased handles, which then fails with [`TransferError::PoolClosed`] and drops its descriptor on
//! release.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::TransferError;
use crate::model::{ChunkInfo, FilePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    /// creates the file if it doesn't exist yet
    ReadWrite,
}

struct PooledHandle {
    file: tokio::fs::File,
    _open_file_guard: throttle::OpenFileGuard,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PooledHandle>,
    borrowed: usize,
    closed: bool,
}

pub struct RandomAccessFilePool {
    path: std::path::PathBuf,
    file_path: FilePath,
    mode: AccessMode,
    state: std::sync::Mutex<PoolState>,
    slots: Arc<tokio::sync::Semaphore>,
    /// signalled whenever a handle goes back to `idle`
    returned: tokio::sync::Notify,
    cancel: tokio_util::sync::CancellationToken,
}

impl std::fmt::Debug for RandomAccessFilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RandomAccessFilePool")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl RandomAccessFilePool {
    /// At most `max_handles` handles are open at the same time; further borrows wait.
    pub fn new(
        path: std::path::PathBuf,
        file_path: FilePath,
        mode: AccessMode,
        max_handles: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            file_path,
            mode,
            state: std::sync::Mutex::new(PoolState::default()),
            slots: Arc::new(tokio::sync::Semaphore::new(max_handles.max(1))),
            returned: tokio::sync::Notify::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn closed_error(&self) -> anyhow::Error {
        TransferError::PoolClosed(self.path.clone()).into()
    }

    async fn open(
        &self,
        open_file_guard: throttle::OpenFileGuard,
    ) -> anyhow::Result<PooledHandle> {
        let mut options = tokio::fs::OpenOptions::new();
        options.read(true);
        if self.mode == AccessMode::ReadWrite {
            options.write(true).create(true).truncate(false);
        }
        let file = options.open(&self.path).await.map_err(|err| {
            crate::error::file_deleted_or(err, &self.file_path)
                .context(format!("cannot open {:?}", &self.path))
        })?;
        Ok(PooledHandle {
            file,
            _open_file_guard: open_file_guard,
        })
    }

    /// Returns an idle handle or opens a new one.
    ///
    /// Opening needs a process-wide open-file permit. While waiting for one, a handle returned to
    /// this pool by another lease is taken instead.
    pub async fn borrow(self: &Arc<Self>) -> anyhow::Result<FileLease> {
        if self.state().closed {
            return Err(self.closed_error());
        }
        let slot = tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.map_err(|_| self.closed_error())?,
            _ = self.cancel.cancelled() => return Err(self.closed_error()),
        };
        let handle = loop {
            let returned = self.returned.notified();
            let idle = {
                let mut state = self.state();
                if state.closed {
                    return Err(self.closed_error());
                }
                state.idle.pop()
            };
            if let Some(handle) = idle {
                break handle;
            }
            tokio::select! {
                guard = throttle::open_file_permit() => break self.open(guard).await?,
                () = returned => {}
                () = self.cancel.cancelled() => return Err(self.closed_error()),
            }
        };
        self.state().borrowed += 1;
        Ok(FileLease {
            handle: Some(handle),
            pool: self.clone(),
            _slot: slot,
        })
    }

    fn release(&self, handle: PooledHandle) {
        let mut state = self.state();
        state.borrowed -= 1;
        if !state.closed {
            state.idle.push(handle);
            self.returned.notify_one();
        }
    }

    /// Closes idle handles; handles still on lease are closed when they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        tracing::debug!("closing {} idle handles of {:?}", idle.len(), self.path);
        self.slots.close();
        self.returned.notify_waiters();
    }

    /// Like [`Self::close`], and also interrupts I/O in progress on leased handles.
    pub fn force_close(&self) {
        self.close();
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn idle_count(&self) -> usize {
        self.state().idle.len()
    }

    pub fn borrowed_count(&self) -> usize {
        self.state().borrowed
    }
}

/// A handle on loan from a [`RandomAccessFilePool`]; returned to the pool on drop.
pub struct FileLease {
    handle: Option<PooledHandle>,
    pool: Arc<RandomAccessFilePool>,
    _slot: tokio::sync::OwnedSemaphorePermit,
}

impl FileLease {
    fn file(&mut self) -> anyhow::Result<&mut tokio::fs::File> {
        match self.handle.as_mut() {
            Some(handle) => Ok(&mut handle.file),
            None => Err(self.pool.closed_error()),
        }
    }

    /// Runs `op` unless the pool gets force-closed first.
    async fn interruptible<T>(
        cancel: tokio_util::sync::CancellationToken,
        path: &std::path::Path,
        op: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        tokio::select! {
            result = op => result,
            _ = cancel.cancelled() => Err(TransferError::PoolClosed(path.to_path_buf()).into()),
        }
    }

    /// Reads exactly `chunk.size` bytes starting at `chunk.offset`.
    pub async fn read_chunk(&mut self, chunk: ChunkInfo) -> anyhow::Result<Vec<u8>> {
        let cancel = self.pool.cancel.clone();
        let path = self.pool.path.clone();
        let file = self.file()?;
        Self::interruptible(cancel, &path, async {
            file.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
            let mut buffer = Vec::new();
            (&mut *file)
                .take(chunk.size)
                .read_to_end(&mut buffer)
                .await
                .with_context(|| format!("failed reading chunk {} of {:?}", chunk, &path))?;
            if buffer.len() as u64 != chunk.size {
                return Err(anyhow::Error::from(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                ))
                .context(format!("{:?} ends before chunk {}", &path, chunk)));
            }
            Ok::<_, anyhow::Error>(buffer)
        })
        .await
    }

    /// Writes `data` at `chunk.offset`; `data` must be exactly the chunk.
    pub async fn write_chunk(&mut self, chunk: ChunkInfo, data: &[u8]) -> anyhow::Result<()> {
        if data.len() as u64 != chunk.size {
            return Err(TransferError::InputStreamSizeMismatch {
                chunk,
                declared: chunk.size,
                actual: data.len() as u64,
            }
            .into());
        }
        let cancel = self.pool.cancel.clone();
        let path = self.pool.path.clone();
        let file = self.file()?;
        Self::interruptible(cancel, &path, async {
            file.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
            file.write_all(data)
                .await
                .with_context(|| format!("failed writing chunk {} of {:?}", chunk, &path))?;
            file.flush().await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }

    /// Truncates or extends the file to `size` bytes.
    pub async fn set_len(&mut self, size: u64) -> anyhow::Result<()> {
        let path = self.pool.path.clone();
        self.file()?
            .set_len(size)
            .await
            .with_context(|| format!("cannot resize {:?} to {} bytes", path, size))
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};

    fn pool(dir: &std::path::Path, mode: AccessMode, max: usize) -> Arc<RandomAccessFilePool> {
        RandomAccessFilePool::new(dir.join("data"), FilePath::new("", "data"), mode, max)
    }

    #[tokio::test]
    async fn handles_are_reused() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("data"), "0123456789")?;
        let pool = pool(tmp.path(), AccessMode::ReadOnly, 4);
        {
            let mut lease = pool.borrow().await?;
            assert_eq!(pool.borrowed_count(), 1);
            assert_eq!(lease.read_chunk(ChunkInfo { offset: 2, size: 3 }).await?, b"234");
        }
        assert_eq!(pool.borrowed_count(), 0);
        assert_eq!(pool.idle_count(), 1);
        let first = pool.borrow().await?;
        let second = pool.borrow().await?;
        assert_eq!(pool.borrowed_count(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(), 2);
        pool.close();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.borrow().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn out_of_order_writes_into_preallocated_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let pool = pool(tmp.path(), AccessMode::ReadWrite, 2);
        pool.borrow().await?.set_len(6).await?;
        let mut tasks = tokio::task::JoinSet::new();
        for (offset, data) in [(4u64, b"ef"), (0, b"ab"), (2, b"cd")] {
            let pool = pool.clone();
            tasks.spawn(async move {
                let mut lease = pool.borrow().await?;
                lease.write_chunk(ChunkInfo { offset, size: 2 }, data).await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res??;
        }
        pool.close();
        assert_eq!(std::fs::read(tmp.path().join("data"))?, b"abcdef");
        Ok(())
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let pool = pool(tmp.path(), AccessMode::ReadWrite, 1);
        let mut lease = pool.borrow().await?;
        let error = lease
            .write_chunk(ChunkInfo { offset: 0, size: 4 }, b"abc")
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TransferError>(),
            Some(TransferError::InputStreamSizeMismatch { actual: 3, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_reported_deleted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let pool = pool(tmp.path(), AccessMode::ReadOnly, 1);
        let error = pool.borrow().await.err().expect("borrow must fail");
        assert_eq!(error_kind(&error), ErrorKind::FileDeleted);
        assert_eq!(pool.borrowed_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn force_close_unblocks_waiting_borrow() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("data"), "x")?;
        let pool = pool(tmp.path(), AccessMode::ReadOnly, 1);
        let lease = pool.borrow().await?;
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pool.force_close();
        assert!(waiter.await?.is_err());
        drop(lease);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.borrowed_count(), 0);
        Ok(())
    }
}
