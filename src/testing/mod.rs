//! Testing utilities for users of the Cadence library.
//!
//! This module provides helpers for testing code that schedules jobs:
//!
//! - [`CountingJob`]: counts executions and records which triggers fired it
//! - [`BlockingJob`]: holds every execution until released or interrupted
//! - [`FailingJob`]: fails a configurable number of times then succeeds
//! - [`RecordingHandler`]: an [`EventHandler`] that keeps every event
//! - [`wait_until`] and [`eventually`]: poll a condition with a deadline

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::context::JobExecutionContext;
use crate::core::job::{Job, JobError};
use crate::core::types::{FireInstanceId, TriggerKey};
use crate::events::{Event, EventHandler};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A job that counts how often it ran.
///
/// With a delay it also tracks how many executions overlapped, which makes
/// it usable for concurrency tests.
///
/// # Example
///
/// ```
/// use cadence::testing::CountingJob;
/// use std::sync::Arc;
///
/// let job = Arc::new(CountingJob::new());
/// assert_eq!(job.count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct CountingJob {
    count: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    delay: Option<Duration>,
    fired: Mutex<Vec<TriggerKey>>,
}

impl CountingJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every execution.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Completed and in-flight executions.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Most executions observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Keys of the triggers that fired this job, in execution order.
    pub fn fired_triggers(&self) -> Vec<TriggerKey> {
        lock(&self.fired).clone()
    }
}

#[async_trait]
impl Job for CountingJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        lock(&self.fired).push(ctx.trigger().key().clone());
        self.count.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A job that blocks until [`BlockingJob::release`] is called.
///
/// Executions stopped through interruption return [`JobError::Interrupted`].
#[derive(Debug, Default)]
pub struct BlockingJob {
    gate: CancellationToken,
    started: AtomicUsize,
    finished: AtomicUsize,
    running: Mutex<Vec<FireInstanceId>>,
}

impl BlockingJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let every current and future execution finish.
    pub fn release(&self) {
        self.gate.cancel();
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Fire instances currently blocked.
    pub fn running(&self) -> Vec<FireInstanceId> {
        lock(&self.running).clone()
    }
}

#[async_trait]
impl Job for BlockingJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        let id = ctx.fire_instance_id();
        lock(&self.running).push(id);
        self.started.fetch_add(1, Ordering::SeqCst);

        let cancel = ctx.cancellation_token();
        let result = tokio::select! {
            _ = self.gate.cancelled() => Ok(()),
            _ = cancel.cancelled() => Err(JobError::Interrupted),
        };

        lock(&self.running).retain(|running| *running != id);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// A job that fails a configurable number of times before succeeding.
///
/// The failure counting is shared by concurrent executions.
///
/// # Example
///
/// ```
/// use cadence::testing::FailingJob;
///
/// // Fails 2 times, then succeeds on the 3rd execution
/// let job = FailingJob::new(2);
/// ```
#[derive(Debug)]
pub struct FailingJob {
    failures_remaining: Mutex<u32>,
    calls: AtomicUsize,
    refire: bool,
    message: String,
}

impl FailingJob {
    /// Fail with [`JobError::Failed`] `fail_count` times.
    pub fn new(fail_count: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(fail_count),
            calls: AtomicUsize::new(0),
            refire: false,
            message: "intentional test failure".to_string(),
        }
    }

    /// Fail with [`JobError::Refire`] instead, so the shell runs the job again at once.
    pub fn refiring(fail_count: u32) -> Self {
        Self {
            refire: true,
            ..Self::new(fail_count)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures_remaining(&self) -> u32 {
        *lock(&self.failures_remaining)
    }
}

#[async_trait]
impl Job for FailingJob {
    async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut remaining = lock(&self.failures_remaining);
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        if self.refire {
            Err(JobError::Refire(self.message.clone()))
        } else {
            Err(JobError::Failed(self.message.clone()))
        }
    }
}

/// Event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in delivery order.
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Number of received events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        lock(&self.events).push(event.clone());
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns the last result.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Like [`wait_until`] for conditions that must await, such as store queries.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
