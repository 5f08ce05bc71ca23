//! Scheduler, trigger and job lifecycle events.
//!
//! Events are emitted on the firing path, so [`EventBus::emit`] never waits
//! for handlers: it queues the event and a dispatcher task delivers it to
//! every registered handler, in emission order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::types::{FireInstanceId, JobKey, TriggerKey};

/// Lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A trigger was stored for a job.
    JobScheduled {
        trigger_key: TriggerKey,
        job_key: JobKey,
        next_fire_time: Option<DateTime<Utc>>,
    },
    /// A trigger was removed.
    JobUnscheduled { trigger_key: TriggerKey },
    /// A job definition was stored.
    JobAdded { job_key: JobKey },
    /// A job definition was removed.
    JobDeleted { job_key: JobKey },
    JobPaused { job_key: JobKey },
    JobResumed { job_key: JobKey },
    TriggerPaused { trigger_key: TriggerKey },
    TriggerResumed { trigger_key: TriggerKey },
    TriggerGroupPaused { group: String },
    TriggerGroupResumed { group: String },

    /// A trigger fired and its job is about to run.
    TriggerFired {
        trigger_key: TriggerKey,
        job_key: JobKey,
        fire_instance_id: FireInstanceId,
        scheduled_fire_time: Option<DateTime<Utc>>,
        fire_time: DateTime<Utc>,
    },

    /// A trigger's fire time was missed and its misfire instruction applied.
    TriggerMisfired {
        trigger_key: TriggerKey,
        job_key: JobKey,
        next_fire_time: Option<DateTime<Utc>>,
    },

    /// The job run by a trigger finished and the store was told.
    TriggerCompleted {
        trigger_key: TriggerKey,
        job_key: JobKey,
        fire_instance_id: FireInstanceId,
        instruction: CompletedExecutionInstruction,
    },

    /// A trigger will never fire again.
    TriggerFinalized { trigger_key: TriggerKey },

    /// A job is about to execute.
    JobToBeExecuted {
        job_key: JobKey,
        trigger_key: TriggerKey,
        fire_instance_id: FireInstanceId,
        recovering: bool,
    },

    /// A job finished executing.
    JobWasExecuted {
        job_key: JobKey,
        trigger_key: TriggerKey,
        fire_instance_id: FireInstanceId,
        duration: Duration,
        error: Option<String>,
        refire_count: u32,
    },

    SchedulerStarted,
    SchedulerInStandby,
    SchedulerResumed,
    SchedulerShuttingDown,
    SchedulerShutdown,
    /// All jobs, triggers and calendars were removed.
    SchedulingDataCleared,

    /// A runtime error that did not reach any caller.
    SchedulerError { message: String },
}

impl Event {
    /// Create a TriggerMisfired event from the trigger after misfire handling.
    pub fn trigger_misfired(trigger: &Trigger) -> Self {
        Event::TriggerMisfired {
            trigger_key: trigger.key().clone(),
            job_key: trigger.job_key().clone(),
            next_fire_time: trigger.next_fire_time(),
        }
    }

    /// Create a TriggerFinalized event.
    pub fn trigger_finalized(trigger_key: TriggerKey) -> Self {
        Event::TriggerFinalized { trigger_key }
    }

    /// Create a SchedulerError event.
    pub fn scheduler_error(message: impl Into<String>) -> Self {
        Event::SchedulerError {
            message: message.into(),
        }
    }

    /// Whether this event reports a failure.
    pub fn is_error(&self) -> bool {
        match self {
            Event::SchedulerError { .. } => true,
            Event::JobWasExecuted { error, .. } => error.is_some(),
            _ => false,
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

struct Inner {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    pending: AtomicUsize,
    drained: Notify,
}

/// Event bus for distributing events to registered handlers.
///
/// Cheap to clone; all clones share handlers and the dispatch queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus with no handlers.
    ///
    /// Events emitted before [`spawn_dispatcher`](Self::spawn_dispatcher) are queued.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.push(handler);
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.inner.handlers.read().await.len()
    }

    /// Queue an event for delivery. Never blocks.
    pub fn emit(&self, event: Event) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.tx.send(event).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Start the task that delivers queued events.
    ///
    /// Returns `None` if a dispatcher was already started.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut rx = self.inner.rx.lock().ok()?.take()?;
        let inner = self.inner.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let handlers: Vec<Arc<dyn EventHandler>> =
                    inner.handlers.read().await.iter().cloned().collect();
                for handler in handlers {
                    handler.handle(&event).await;
                }
                if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    inner.drained.notify_waiters();
                }
            }
        }))
    }

    /// Wait until every event emitted so far has been delivered, or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let drained = self.inner.drained.notified();
                if self.inner.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                // Re-check periodically in case the notification raced the load.
                let _ = tokio::time::timeout(Duration::from_millis(10), drained).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TriggerFired {
                trigger_key,
                job_key,
                fire_instance_id,
                ..
            } => tracing::info!(trigger = %trigger_key, job = %job_key, fire_instance = %fire_instance_id, "trigger fired"),
            Event::TriggerMisfired {
                trigger_key,
                next_fire_time,
                ..
            } => tracing::warn!(trigger = %trigger_key, next_fire_time = ?next_fire_time, "trigger misfired"),
            Event::JobWasExecuted {
                job_key,
                duration,
                error: Some(error),
                ..
            } => tracing::warn!(job = %job_key, duration_ms = duration.as_millis() as u64, error = %error, "job failed"),
            Event::JobWasExecuted {
                job_key, duration, ..
            } => tracing::info!(job = %job_key, duration_ms = duration.as_millis() as u64, "job completed"),
            Event::SchedulerError { message } => tracing::error!(error = %message, "scheduler error"),
            other => tracing::debug!(event = ?other, "scheduler event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use crate::testing::RecordingHandler;

    /// Test handler that counts events.
    struct CountingHandler {
        count: AtomicU32,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                count: AtomicU32::new(0),
            }
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Handler slow enough that a blocking emit would be noticed.
    struct SlowHandler;

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, _event: &Event) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let handler = Arc::new(RecordingHandler::new());
        let bus = EventBus::new();
        bus.register(handler.clone()).await;
        bus.spawn_dispatcher();

        bus.emit(Event::SchedulerStarted);
        bus.emit(Event::JobAdded {
            job_key: JobKey::from("report"),
        });
        bus.emit(Event::SchedulerShutdown);
        assert!(bus.flush(Duration::from_secs(1)).await);

        let events = handler.events();
        assert_eq!(
            events,
            vec![
                Event::SchedulerStarted,
                Event::JobAdded {
                    job_key: JobKey::from("report")
                },
                Event::SchedulerShutdown
            ]
        );
    }

    #[tokio::test]
    async fn test_events_queued_before_dispatcher_starts() {
        let handler = Arc::new(CountingHandler::new());
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        bus.emit(Event::SchedulerStarted);
        assert_eq!(handler.count(), 0);

        bus.spawn_dispatcher();
        assert!(bus.flush(Duration::from_secs(1)).await);
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_handlers() {
        let bus = EventBus::new();
        bus.register(Arc::new(SlowHandler)).await;
        bus.spawn_dispatcher();

        let started = std::time::Instant::now();
        for _ in 0..5 {
            bus.emit(Event::SchedulerStarted);
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_multiple_handlers_receive_same_event() {
        let handler1 = Arc::new(CountingHandler::new());
        let handler2 = Arc::new(CountingHandler::new());

        let bus = EventBus::new();
        bus.register(handler1.clone()).await;
        bus.register(handler2.clone()).await;
        assert_eq!(bus.handler_count().await, 2);
        bus.spawn_dispatcher();

        bus.emit(Event::scheduler_error("disk full"));
        assert!(bus.flush(Duration::from_secs(1)).await);

        assert_eq!(handler1.count(), 1);
        assert_eq!(handler2.count(), 1);
    }

    #[test]
    fn test_dispatcher_spawns_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let bus = EventBus::new();
            assert!(bus.spawn_dispatcher().is_some());
            assert!(bus.spawn_dispatcher().is_none());
        });
    }

    #[test]
    fn test_error_classification() {
        assert!(Event::scheduler_error("x").is_error());
        assert!(!Event::SchedulerStarted.is_error());
    }
}
