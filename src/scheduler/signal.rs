//! Wake-up signalling between the job store and the fire loop.
//!
//! The store calls a [`SchedulerSignaler`] whenever something it did may
//! change what the fire loop should be waiting for (a new earlier trigger,
//! a misfire, an unblocked job) or when listeners need to hear about it.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::core::trigger::Trigger;
use crate::core::types::JobKey;
use crate::events::{Event, EventBus};

/// Callback surface the store uses to reach the scheduler.
///
/// Implementations must not block: they are called on the firing path.
pub trait SchedulerSignaler: Send + Sync {
    /// Something changed that may make an earlier trigger available.
    ///
    /// `candidate` is the new earliest fire time if known, `None` if not.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);

    /// A trigger misfired and its misfire instruction was applied.
    fn notify_trigger_misfired(&self, trigger: &Trigger);

    /// A trigger will never fire again.
    fn notify_trigger_finalized(&self, trigger: &Trigger);

    /// A non-durable job was deleted because its last trigger went away.
    fn notify_job_deleted(&self, key: &JobKey);

    /// A runtime error listeners should hear about.
    fn notify_scheduler_error(&self, message: &str);
}

/// Signaler that drops everything. Used by stores that were never attached to a scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
    fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
    fn notify_trigger_misfired(&self, _trigger: &Trigger) {}
    fn notify_trigger_finalized(&self, _trigger: &Trigger) {}
    fn notify_job_deleted(&self, _key: &JobKey) {}
    fn notify_scheduler_error(&self, _message: &str) {}
}

#[derive(Debug, Default)]
struct SignalState {
    signaled: bool,
    candidate: Option<DateTime<Utc>>,
}

/// Latched wake-up flag the fire loop sleeps on.
#[derive(Debug, Default)]
pub struct SchedulingSignal {
    notify: Notify,
    state: Mutex<SignalState>,
}

impl SchedulingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scheduling change and wake the loop.
    ///
    /// Multiple signals before the loop looks collapse to the earliest
    /// candidate; an unknown candidate wins over any known one.
    pub fn signal(&self, candidate: Option<DateTime<Utc>>) {
        if let Ok(mut state) = self.state.lock() {
            state.candidate = if state.signaled {
                match (state.candidate, candidate) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    _ => None,
                }
            } else {
                candidate
            };
            state.signaled = true;
        }
        self.notify.notify_one();
    }

    /// Whether a change was signalled since the last [`clear`](Self::clear).
    pub fn is_signaled(&self) -> bool {
        self.state.lock().map(|s| s.signaled).unwrap_or(true)
    }

    /// The pending candidate, if a change was signalled.
    ///
    /// Returns `Some(None)` when a change with unknown time is pending.
    pub fn pending(&self) -> Option<Option<DateTime<Utc>>> {
        let state = self.state.lock().ok()?;
        state.signaled.then_some(state.candidate)
    }

    /// Forget any pending change.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.signaled = false;
            state.candidate = None;
        }
    }

    /// Wait until signalled. Returns immediately if a change is already latched.
    ///
    /// A permit left behind by a signal that was since cleared is consumed
    /// without returning.
    pub async fn notified(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_signaled() {
                return;
            }
            notified.await;
            if self.is_signaled() {
                return;
            }
        }
    }
}

/// The signaler a running scheduler hands to its store.
#[derive(Debug)]
pub(crate) struct EngineSignaler {
    signal: std::sync::Arc<SchedulingSignal>,
    events: EventBus,
}

impl EngineSignaler {
    pub(crate) fn new(signal: std::sync::Arc<SchedulingSignal>, events: EventBus) -> Self {
        Self { signal, events }
    }
}

impl SchedulerSignaler for EngineSignaler {
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal.signal(candidate);
    }

    fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.events.emit(Event::trigger_misfired(trigger));
    }

    fn notify_trigger_finalized(&self, trigger: &Trigger) {
        self.events.emit(Event::trigger_finalized(trigger.key().clone()));
    }

    fn notify_job_deleted(&self, key: &JobKey) {
        self.events.emit(Event::JobDeleted { job_key: key.clone() });
    }

    fn notify_scheduler_error(&self, message: &str) {
        self.events.emit(Event::scheduler_error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn test_signal_collapses_to_earliest() {
        let s = SchedulingSignal::new();
        let now = Utc::now();
        s.signal(Some(now + Duration::seconds(10)));
        s.signal(Some(now + Duration::seconds(5)));
        assert_eq!(s.pending(), Some(Some(now + Duration::seconds(5))));
    }

    #[test]
    fn test_unknown_candidate_wins() {
        let s = SchedulingSignal::new();
        s.signal(Some(Utc::now()));
        s.signal(None);
        assert_eq!(s.pending(), Some(None));
    }

    #[test]
    fn test_clear_resets() {
        let s = SchedulingSignal::new();
        s.signal(None);
        assert!(s.is_signaled());
        s.clear();
        assert!(!s.is_signaled());
        assert_eq!(s.pending(), None);
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_latched() {
        let s = Arc::new(SchedulingSignal::new());
        s.signal(None);
        tokio::time::timeout(std::time::Duration::from_millis(100), s.notified())
            .await
            .expect("latched signal should wake immediately");
    }

    #[tokio::test]
    async fn test_cleared_signal_does_not_wake() {
        let s = Arc::new(SchedulingSignal::new());
        s.signal(None);
        s.clear();
        let woke = tokio::time::timeout(std::time::Duration::from_millis(50), s.notified()).await;
        assert!(woke.is_err());

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.notified().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        s.signal(Some(Utc::now()));
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("a new signal should wake the waiter")
            .unwrap();
    }
}
