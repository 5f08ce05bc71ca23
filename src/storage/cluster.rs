//! Background cluster maintenance.
//!
//! A clustered node must keep proving it is alive. The [`ClusterManager`]
//! task calls [`JobStore::checkin`] on a fixed interval; the store records
//! the heartbeat and, in the same step, recovers the in-flight work of any
//! node that stopped checking in. A failed checkin is retried with a growing
//! delay, capped at the checkin interval.
//!
//! Once checkins have failed for longer than the other nodes wait before
//! declaring this one dead, [`CheckinHealth::is_current`] turns false and
//! the fire loop stops acquiring triggers until a checkin succeeds again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::JobStore;

/// When this node last checked in successfully.
#[derive(Debug)]
pub struct CheckinHealth {
    origin: Instant,
    last_success_ms: AtomicU64,
    failures: AtomicU64,
    stale_after: Duration,
}

impl CheckinHealth {
    /// A node whose last checkin succeeded just now.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_success_ms: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            stale_after,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Record a successful checkin; returns the failures it ended.
    pub fn record_success(&self) -> u64 {
        self.last_success_ms.store(self.elapsed_ms(), Ordering::SeqCst);
        self.failures.swap(0, Ordering::SeqCst)
    }

    /// Record a failed checkin; returns the consecutive failure count.
    pub fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Time since the last successful checkin.
    pub fn since_last_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    /// False once peers may already consider this node failed.
    pub fn is_current(&self) -> bool {
        self.since_last_success() <= self.stale_after
    }
}

/// Delay before the next attempt after `failures` consecutive failed checkins.
fn retry_delay(failures: u64, base: Duration, cap: Duration) -> Duration {
    let shift = failures.saturating_sub(1).min(16) as u32;
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Periodic checkin task for a clustered store.
pub struct ClusterManager {
    store: Arc<dyn JobStore>,
    checkin_interval: Duration,
    retry_interval: Duration,
    cancel: CancellationToken,
    health: Arc<CheckinHealth>,
}

impl ClusterManager {
    pub fn new(store: Arc<dyn JobStore>, checkin_interval: Duration, retry_interval: Duration) -> Self {
        let stale_after = checkin_interval + store.checkin_grace();
        Self {
            store,
            checkin_interval,
            retry_interval: retry_interval.min(checkin_interval),
            cancel: CancellationToken::new(),
            health: Arc::new(CheckinHealth::new(stale_after)),
        }
    }

    /// Consecutive failed checkins so far.
    pub fn consecutive_failures(&self) -> u64 {
        self.health.consecutive_failures()
    }

    /// Checkin state shared with the fire loop.
    pub fn health(&self) -> Arc<CheckinHealth> {
        self.health.clone()
    }

    /// Spawn the checkin loop.
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let health = self.health.clone();
        let interval = self.checkin_interval;
        let retry = self.retry_interval;

        info!(
            instance = %store.instance_id(),
            interval_ms = interval.as_millis() as u64,
            "cluster manager started"
        );

        tokio::spawn(async move {
            let mut wait = interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                match store.checkin().await {
                    Ok(()) => {
                        let previous = health.record_success();
                        if previous > 0 {
                            info!(failed_attempts = previous, "cluster checkin recovered");
                        } else {
                            debug!("cluster checkin");
                        }
                        wait = interval;
                    }
                    Err(e) => {
                        let was_current = health.is_current();
                        let count = health.record_failure();
                        wait = retry_delay(count, retry, interval);
                        warn!(
                            error = %e,
                            consecutive_failures = count,
                            retry_ms = wait.as_millis() as u64,
                            "cluster checkin failed"
                        );
                        if was_current && !health.is_current() {
                            error!(
                                stale_ms = health.since_last_success().as_millis() as u64,
                                "checkin is stale; firing suspended until a checkin succeeds"
                            );
                        }
                    }
                }
            }
            debug!("cluster manager stopped");
        })
    }

    /// Stop the checkin loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
