//! The bounded worker pool transaction-user callbacks run on (§5), so
//! transport I/O is never blocked by user code. Rather than a pool of OS
//! threads, this is a `tokio::sync::Semaphore`-gated spawn helper: each
//! accepted task acquires a permit before running and releases it on
//! completion, capping concurrency at `max` without a fixed thread count.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// `min` is carried for parity with the source's configurable pool
/// bounds but doesn't pre-spawn anything — `tokio::spawn` tasks are
/// cheap enough that there is no idle-worker cost to amortize.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    #[allow(dead_code)]
    min: usize,
    max: usize,
}

impl WorkerPool {
    pub fn new(min: usize, max: usize) -> Self {
        WorkerPool { semaphore: Arc::new(Semaphore::new(max)), in_flight: Arc::new(AtomicUsize::new(0)), min, max }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Runs `task` once a permit is available, off the caller's task.
    /// Permit acquisition can suspend the caller if the pool is
    /// saturated; it never blocks an OS thread.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                warn!("worker pool semaphore closed, dropping callback");
                return;
            };
            in_flight.fetch_add(1, Ordering::Relaxed);
            task.await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    /// Closes the pool: in-flight tasks finish, but no new permits are
    /// handed out afterward. Callers already awaiting `acquire` observe
    /// a closed semaphore, matching the synthetic cancellation error
    /// `stop()` promises in §5.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn spawned_tasks_run_and_release_their_permit() {
        let pool = WorkerPool::new(2, 4);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_pool_drops_subsequent_work() {
        let pool = WorkerPool::new(1, 1);
        pool.close();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
