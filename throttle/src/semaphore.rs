use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket that is a no-op until [`Semaphore::setup`] is called with a non-zero value.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.enabled.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Holds a permit until the returned value is dropped.
    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if self.is_enabled() {
            // the semaphore is never closed
            self.sem.acquire().await.ok()
        } else {
            None
        }
    }

    /// Takes `value` tokens out of the bucket for good; they come back through replenishment.
    pub async fn consume_many(&self, value: u32) {
        if self.is_enabled() {
            if let Ok(permit) = self.sem.acquire_many(value).await {
                permit.forget();
            }
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let current = self.sem.available_permits();
            if current < replenish {
                self.sem.add_permits(replenish - current);
            }
        }
    }
}
