//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Acquiring due triggers from the job store in (fire time, priority, key) order
//! - Waiting until their fire time, releasing them if something earlier shows up
//! - Firing them and handing the jobs to the worker pool
//! - Standby, resume and shutdown
//! - Cluster checkin for clustered stores
//! - Event emission

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::{Clock, SharedClock};
use crate::core::job::{JobFactory, JobRegistry};
use crate::core::trigger::CompletedExecutionInstruction;
use crate::core::types::InstanceId;
use crate::events::{Event, EventBus};
use crate::execution::{ExecutingJobs, JobRunShell, ShellEnvironment, WorkerPool};
use crate::storage::cluster::ClusterManager;
use crate::storage::{AcquiredTrigger, JobStore, TriggerFiredResult};

use super::handle::{SchedulerHandle, COMMAND_CHANNEL_BUFFER};
use super::signal::{EngineSignaler, SchedulingSignal};
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Acquired triggers are fired once they are this close to their fire time.
const FIRE_AHEAD: chrono::Duration = chrono::Duration::milliseconds(2);

/// Below this much remaining wait, releasing acquired triggers for an
/// earlier candidate costs more than it saves.
const PERSISTENT_RELEASE_THRESHOLD: chrono::Duration = chrono::Duration::milliseconds(70);
const MEMORY_RELEASE_THRESHOLD: chrono::Duration = chrono::Duration::milliseconds(7);

/// Upper bound on how long the loop waits for a free worker before re-checking its state.
const CAPACITY_WAIT: Duration = Duration::from_millis(500);

/// How often a node with a stale checkin looks again before acquiring.
const STALE_CHECKIN_POLL: Duration = Duration::from_millis(100);

/// State shared between the fire loop, the handle and the job shells.
pub(crate) struct SchedulerCore {
    pub(crate) name: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) factory: Arc<dyn JobFactory>,
    pub(crate) events: EventBus,
    pub(crate) signal: Arc<SchedulingSignal>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
    pub(crate) executing: ExecutingJobs,
    pub(crate) clock: SharedClock,
}

impl SchedulerCore {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Wake the fire loop because the schedule may have changed.
    pub(crate) fn signal_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal.signal(candidate);
    }
}

/// Main scheduler.
///
/// Configure with the `with_*` builders, then [`start`](Self::start) it to
/// obtain a [`SchedulerHandle`].
pub struct Scheduler {
    name: String,
    store: Arc<dyn JobStore>,
    factory: Arc<dyn JobFactory>,
    events: EventBus,
    thread_count: usize,
    batch_max_count: usize,
    batch_time_window: chrono::Duration,
    idle_wait: Duration,
    db_failure_retry_interval: Duration,
    shutdown_timeout: Duration,
    interrupt_jobs_on_shutdown: bool,
    start_in_standby: bool,
}

impl Scheduler {
    /// Create a scheduler on the given store.
    pub fn new<S: JobStore + 'static>(store: S) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create a scheduler on a shared store.
    pub fn with_store(store: Arc<dyn JobStore>) -> Self {
        Self {
            name: "cadence".to_string(),
            store,
            factory: Arc::new(JobRegistry::new().with_command_jobs()),
            events: EventBus::new(),
            thread_count: 10,
            batch_max_count: 1,
            batch_time_window: chrono::Duration::zero(),
            idle_wait: Duration::from_secs(30),
            db_failure_retry_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            interrupt_jobs_on_shutdown: false,
            start_in_standby: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the factory that turns job definitions into runnable jobs.
    pub fn with_job_factory<F: JobFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Number of jobs that may run at once.
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count.max(1);
        self
    }

    /// Acquire up to `max_count` triggers per pass, spanning at most `window`.
    pub fn with_batch(mut self, max_count: usize, window: chrono::Duration) -> Self {
        self.batch_max_count = max_count.max(1);
        self.batch_time_window = window.max(chrono::Duration::zero());
        self
    }

    /// How far ahead triggers are acquired, and how long an idle loop sleeps.
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    /// Pause between retries after the store failed.
    pub fn with_db_failure_retry_interval(mut self, interval: Duration) -> Self {
        self.db_failure_retry_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Cancel running jobs when shutting down.
    pub fn with_interrupt_jobs_on_shutdown(mut self, interrupt: bool) -> Self {
        self.interrupt_jobs_on_shutdown = interrupt;
        self
    }

    /// Start in standby: the API works but nothing fires until `start` is called on the handle.
    pub fn with_start_in_standby(mut self, standby: bool) -> Self {
        self.start_in_standby = standby;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// Recovery of work left behind by crashed instances runs here, before
    /// the fire loop starts; a store that cannot recover fails the start.
    pub async fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let signal = Arc::new(SchedulingSignal::new());
        let clock = self.store.clock();
        let instance_id = self.store.instance_id();

        self.events.spawn_dispatcher();
        self.store
            .initialize(Arc::new(EngineSignaler::new(
                signal.clone(),
                self.events.clone(),
            )))
            .await?;
        self.store.scheduler_started().await?;

        let cluster = if self.store.is_clustered() {
            let interval = self.store.checkin_interval();
            let manager = ClusterManager::new(
                self.store.clone(),
                interval,
                self.db_failure_retry_interval,
            );
            let task = manager.start();
            Some((manager, task))
        } else {
            None
        };

        let initial = if self.start_in_standby {
            self.store.scheduler_paused().await?;
            SchedulerState::Standby
        } else {
            SchedulerState::Started
        };
        let core = Arc::new(SchedulerCore {
            name: self.name.clone(),
            store: self.store.clone(),
            factory: self.factory.clone(),
            events: self.events.clone(),
            signal,
            state: Arc::new(RwLock::new(initial)),
            executing: ExecutingJobs::default(),
            clock,
        });

        let halted = CancellationToken::new();
        let shell_env = Arc::new(ShellEnvironment {
            store: self.store.clone(),
            factory: self.factory.clone(),
            events: self.events.clone(),
            executing: core.executing.clone(),
            halted: halted.clone(),
            completion_retry_interval: self.db_failure_retry_interval,
        });

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = SchedulerHandle::new(command_tx, core.clone());

        info!(
            scheduler = %self.name,
            instance = %instance_id,
            threads = self.thread_count,
            clustered = self.store.is_clustered(),
            persistent = self.store.supports_persistence(),
            "scheduler started"
        );
        self.events.emit(match initial {
            SchedulerState::Standby => Event::SchedulerInStandby,
            _ => Event::SchedulerStarted,
        });

        let release_threshold = if self.store.supports_persistence() {
            PERSISTENT_RELEASE_THRESHOLD
        } else {
            MEMORY_RELEASE_THRESHOLD
        };
        let fire_loop = FireLoop {
            core,
            pool: WorkerPool::new(self.thread_count),
            shell_env,
            halted,
            commands: command_rx,
            cluster,
            instance_id,
            batch_max_count: self.batch_max_count,
            batch_time_window: self.batch_time_window,
            idle_wait: self.idle_wait,
            db_failure_retry_interval: self.db_failure_retry_interval,
            shutdown_timeout: self.shutdown_timeout,
            interrupt_jobs_on_shutdown: self.interrupt_jobs_on_shutdown,
            release_threshold,
            consecutive_failures: 0,
            checkin_suspended: false,
            shutdown_request: None,
        };
        let task = tokio::spawn(fire_loop.run());
        Ok((handle, task))
    }
}

/// Why a wait ended.
enum Wake {
    Elapsed,
    Signaled,
    Command,
}

struct ShutdownRequest {
    wait_for_jobs: bool,
    responders: Vec<oneshot::Sender<()>>,
}

/// The fire-selection loop.
struct FireLoop {
    core: Arc<SchedulerCore>,
    pool: WorkerPool,
    shell_env: Arc<ShellEnvironment>,
    halted: CancellationToken,
    commands: mpsc::Receiver<SchedulerCommand>,
    cluster: Option<(ClusterManager, JoinHandle<()>)>,
    instance_id: InstanceId,
    batch_max_count: usize,
    batch_time_window: chrono::Duration,
    idle_wait: Duration,
    db_failure_retry_interval: Duration,
    shutdown_timeout: Duration,
    interrupt_jobs_on_shutdown: bool,
    release_threshold: chrono::Duration,
    consecutive_failures: u32,
    checkin_suspended: bool,
    shutdown_request: Option<ShutdownRequest>,
}

impl FireLoop {
    async fn run(mut self) {
        while self.shutdown_request.is_none() {
            if *self.core.state.read().await != SchedulerState::Started {
                match self.commands.recv().await {
                    Some(command) => self.handle_command(command).await,
                    None => self.request_shutdown(false, None),
                }
                continue;
            }

            let available = tokio::select! {
                n = self.pool.block_for_available_threads(CAPACITY_WAIT) => Some(n),
                command = self.commands.recv() => {
                    self.on_command(command).await;
                    None
                }
            };
            match available {
                Some(n) if n > 0 => self.fire_pass(n).await,
                _ => continue,
            }
        }
        self.shut_down().await;
    }

    /// One acquisition pass: acquire, wait for the fire time, fire.
    async fn fire_pass(&mut self, available: usize) {
        let store = self.core.store.clone();
        if !self.checkin_current() {
            if !self.checkin_suspended {
                self.checkin_suspended = true;
                warn!(instance = %self.instance_id, "cluster checkin is stale; not acquiring triggers");
                self.core
                    .events
                    .emit(Event::scheduler_error("cluster checkin is stale; firing suspended"));
            }
            self.wait(STALE_CHECKIN_POLL, false).await;
            return;
        }
        if self.checkin_suspended {
            self.checkin_suspended = false;
            info!(instance = %self.instance_id, "cluster checkin current again; resuming firing");
        }

        // Cleared before acquiring so a change made during acquisition is not lost.
        self.core.signal.clear();

        let now = self.core.now();
        let horizon = now + chrono::Duration::from_std(self.idle_wait).unwrap_or(chrono::Duration::seconds(30));
        let max_count = available.min(self.batch_max_count);
        let triggers = match store
            .acquire_next_triggers(horizon, max_count, self.batch_time_window)
            .await
        {
            Ok(triggers) => {
                if self.consecutive_failures > 0 {
                    info!(failed_attempts = self.consecutive_failures, "job store reachable again");
                }
                self.consecutive_failures = 0;
                triggers
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    self.core
                        .events
                        .emit(Event::scheduler_error(format!("cannot acquire triggers: {}", e)));
                }
                error!(error = %e, attempts = self.consecutive_failures, "trigger acquisition failed; backing off");
                let backoff = if e.is_transient() {
                    self.db_failure_retry_interval.min(Duration::from_secs(1))
                } else {
                    self.db_failure_retry_interval
                };
                self.wait(backoff, false).await;
                return;
            }
        };

        let Some(first) = triggers.first().and_then(|t| t.fire_time()) else {
            for acquired in &triggers {
                self.release(acquired).await;
            }
            debug!(idle_ms = self.idle_wait.as_millis() as u64, "no triggers due; idling");
            self.wait(self.idle_wait, true).await;
            return;
        };

        // Wait for the batch's fire time, unless something earlier appears.
        loop {
            let remaining = first - self.core.now();
            if remaining <= FIRE_AHEAD {
                break;
            }
            let sleep = (remaining - FIRE_AHEAD).to_std().unwrap_or(Duration::ZERO);
            let wake = self.wait(sleep, true).await;
            if !self.is_firing().await {
                debug!(count = triggers.len(), "firing stopped; releasing acquired triggers");
                self.release_all(&triggers).await;
                return;
            }
            if matches!(wake, Wake::Signaled) && self.earlier_candidate(first) {
                debug!(count = triggers.len(), "earlier trigger scheduled; releasing acquired triggers");
                self.release_all(&triggers).await;
                return;
            }
        }

        for (index, acquired) in triggers.iter().enumerate() {
            if !self.is_firing().await || !self.checkin_current() {
                self.release_all(&triggers[index..]).await;
                return;
            }
            self.fire(acquired).await;
        }
    }

    async fn fire(&mut self, acquired: &AcquiredTrigger) {
        let store = self.core.store.clone();
        let bundle = match store.trigger_fired(acquired).await {
            Ok(TriggerFiredResult::Fired(bundle)) => bundle,
            Ok(TriggerFiredResult::Blocked) => {
                debug!(trigger = %acquired.key(), "job is executing; trigger blocked");
                return;
            }
            Ok(TriggerFiredResult::Gone) => {
                debug!(trigger = %acquired.key(), "trigger changed before it fired");
                self.release(acquired).await;
                return;
            }
            Err(e) => {
                error!(trigger = %acquired.key(), error = %e, "cannot record trigger firing");
                self.core.events.emit(Event::scheduler_error(format!(
                    "cannot fire trigger {}: {}",
                    acquired.key(),
                    e
                )));
                self.release(acquired).await;
                return;
            }
        };

        self.core.events.emit(Event::TriggerFired {
            trigger_key: bundle.trigger.key().clone(),
            job_key: bundle.job_detail.key().clone(),
            fire_instance_id: bundle.fire_instance_id,
            scheduled_fire_time: bundle.scheduled_fire_time,
            fire_time: bundle.fire_time,
        });

        let trigger = bundle.trigger.clone();
        let job = bundle.job_detail.clone();
        let fire_instance_id = bundle.fire_instance_id;
        let shell = JobRunShell::new(self.shell_env.clone(), *bundle);
        if let Err(e) = self.pool.run_job(shell.run()) {
            error!(trigger = %trigger.key(), job = %job.key(), error = %e, "worker pool refused job");
            self.core.events.emit(Event::scheduler_error(format!(
                "worker pool refused job {}: {}",
                job.key(),
                e
            )));
            if let Err(e) = store
                .trigger_completed(
                    &trigger,
                    fire_instance_id,
                    &job,
                    CompletedExecutionInstruction::SetAllJobTriggersError,
                )
                .await
            {
                error!(trigger = %trigger.key(), error = %e, "cannot mark triggers of refused job as errored");
            }
        }
    }

    async fn release(&self, acquired: &AcquiredTrigger) {
        if let Err(e) = self.core.store.release_acquired_trigger(acquired).await {
            // Left ACQUIRED; recovery at the next start returns it to WAITING.
            error!(trigger = %acquired.key(), error = %e, "cannot release acquired trigger");
        }
    }

    async fn release_all(&self, triggers: &[AcquiredTrigger]) {
        for acquired in triggers {
            self.release(acquired).await;
        }
    }

    /// Whether a signalled change is worth giving up the current batch for.
    fn earlier_candidate(&self, batch_time: DateTime<Utc>) -> bool {
        let earlier = match self.core.signal.pending() {
            None => false,
            Some(None) => true,
            Some(Some(candidate)) => candidate < batch_time,
        };
        if !earlier {
            return false;
        }
        batch_time - self.core.now() >= self.release_threshold
    }

    /// Peers recover the fired work of a node whose checkin has gone stale,
    /// so such a node must not fire.
    fn checkin_current(&self) -> bool {
        self.cluster
            .as_ref()
            .map_or(true, |(manager, _)| manager.health().is_current())
    }

    async fn is_firing(&self) -> bool {
        self.shutdown_request.is_none() && *self.core.state.read().await == SchedulerState::Started
    }

    /// Sleep up to `duration`, waking early for commands and, if asked, scheduling signals.
    async fn wait(&mut self, duration: Duration, watch_signal: bool) -> Wake {
        let signal = self.core.signal.clone();
        let wake = tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(Wake::Elapsed),
            _ = signal.notified(), if watch_signal => Ok(Wake::Signaled),
            command = self.commands.recv() => Err(command),
        };
        match wake {
            Ok(wake) => wake,
            Err(command) => {
                self.on_command(command).await;
                Wake::Command
            }
        }
    }

    async fn on_command(&mut self, command: Option<SchedulerCommand>) {
        match command {
            Some(command) => self.handle_command(command).await,
            // Every handle is gone; nobody can stop us later.
            None => self.request_shutdown(false, None),
        }
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Start { response } => {
                let mut state = self.core.state.write().await;
                if *state == SchedulerState::Standby {
                    *state = SchedulerState::Started;
                    drop(state);
                    if let Err(e) = self.core.store.scheduler_resumed().await {
                        warn!(error = %e, "job store failed to resume");
                    }
                    info!(scheduler = %self.core.name, "scheduler resumed");
                    self.core.events.emit(Event::SchedulerResumed);
                }
                let _ = response.send(());
            }
            SchedulerCommand::Standby { response } => {
                let mut state = self.core.state.write().await;
                if *state == SchedulerState::Started {
                    *state = SchedulerState::Standby;
                    drop(state);
                    if let Err(e) = self.core.store.scheduler_paused().await {
                        warn!(error = %e, "job store failed to pause");
                    }
                    info!(scheduler = %self.core.name, "scheduler in standby");
                    self.core.events.emit(Event::SchedulerInStandby);
                }
                let _ = response.send(());
            }
            SchedulerCommand::Shutdown {
                wait_for_jobs,
                response,
            } => self.request_shutdown(wait_for_jobs, Some(response)),
        }
    }

    fn request_shutdown(&mut self, wait_for_jobs: bool, response: Option<oneshot::Sender<()>>) {
        let request = self.shutdown_request.get_or_insert(ShutdownRequest {
            wait_for_jobs,
            responders: Vec::new(),
        });
        request.wait_for_jobs |= wait_for_jobs;
        request.responders.extend(response);
    }

    async fn shut_down(mut self) {
        let Some(request) = self.shutdown_request.take() else {
            return;
        };
        *self.core.state.write().await = SchedulerState::ShuttingDown;
        info!(
            scheduler = %self.core.name,
            instance = %self.instance_id,
            wait_for_jobs = request.wait_for_jobs,
            "scheduler shutting down"
        );
        self.core.events.emit(Event::SchedulerShuttingDown);

        if let Err(e) = self.core.store.scheduler_paused().await {
            warn!(error = %e, "job store failed to pause");
        }
        if let Some((manager, task)) = self.cluster.take() {
            manager.shutdown();
            let _ = task.await;
        }
        if self.interrupt_jobs_on_shutdown {
            self.core.executing.interrupt_all();
        }

        let running = self.pool.active();
        if request.wait_for_jobs && running > 0 {
            info!(
                running,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "waiting for running jobs to complete"
            );
        }
        self.pool
            .shutdown(request.wait_for_jobs, self.shutdown_timeout)
            .await;
        self.halted.cancel();

        if let Err(e) = self.core.store.shutdown().await {
            warn!(error = %e, "job store shutdown failed");
        }
        *self.core.state.write().await = SchedulerState::Shutdown;
        self.core.events.emit(Event::SchedulerShutdown);
        self.core.events.flush(Duration::from_secs(1)).await;
        info!(scheduler = %self.core.name, "scheduler shut down");

        for responder in request.responders {
            let _ = responder.send(());
        }
        // Late shutdown requests from handle clones still get an answer.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                SchedulerCommand::Start { response }
                | SchedulerCommand::Standby { response }
                | SchedulerCommand::Shutdown { response, .. } => {
                    let _ = response.send(());
                }
            }
        }
    }
}
