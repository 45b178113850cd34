//! Process-wide resource throttles for sync clients and servers
//!
//! Two independent limits are available, each disabled until configured:
//!
//! 1. **Open files** - bounds the number of file descriptors held by file pools at once
//! 2. **Chunk operations** - bounds the number of chunk reads/writes per second
//!
//! The rate limit is a token bucket refilled by a background task:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_open_files(1024);
//!
//! // 10 tokens every 100ms = 100 chunk operations per second
//! throttle::init_ops_tokens(10);
//! tokio::spawn(throttle::run_ops_replenish_thread(10, Duration::from_millis(100)));
//!
//! let _guard = throttle::open_file_permit().await;
//! throttle::get_ops_token().await;
//! # }
//! ```

mod semaphore;

static OPEN_FILES_LIMIT: semaphore::Semaphore = semaphore::Semaphore::new();
static OPS_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

/// Keeps one open-file slot taken while alive.
pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume_many(1).await;
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.run_replenish_thread(replenish, interval).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_limits_do_not_block() {
        let _guard = open_file_permit().await;
        get_ops_token().await;
    }
}
