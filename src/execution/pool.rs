//! Bounded worker pool.
//!
//! Every running job holds one semaphore permit for its whole run. The
//! fire loop asks [`WorkerPool::block_for_available_threads`] before it
//! acquires triggers, so it never reserves more triggers than it can run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Why the pool refused a job.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("no worker available")]
    Exhausted,

    #[error("worker pool is shut down")]
    ShutDown,
}

/// Fixed-size pool of job workers on the tokio runtime.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs at once.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently free.
    pub fn available(&self) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            0
        } else {
            self.semaphore.available_permits()
        }
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until at least one worker is free, or `timeout` elapses.
    ///
    /// Returns the number of free workers, which is zero on timeout.
    pub async fn block_for_available_threads(&self, timeout: Duration) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }
        if self.semaphore.available_permits() > 0 {
            return self.semaphore.available_permits();
        }
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                drop(permit);
                self.available()
            }
            _ => 0,
        }
    }

    /// Start a job on a free worker without waiting.
    pub fn run_job<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolError::Exhausted)?;
        self.tracker.spawn(async move {
            job.await;
            drop(permit);
        });
        Ok(())
    }

    /// Refuse new jobs. With `wait`, also wait up to `timeout` for running jobs.
    ///
    /// Returns whether every job finished.
    pub async fn shutdown(&self, wait: bool, timeout: Duration) -> bool {
        self.shut_down.store(true, Ordering::SeqCst);
        self.tracker.close();
        if !wait {
            return self.tracker.is_empty();
        }
        let finished = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        if !finished {
            tracing::warn!(
                running = self.tracker.len(),
                timeout_ms = timeout.as_millis() as u64,
                "jobs still running after shutdown timeout"
            );
        }
        finished
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(10)
    }
}
