//! Job store abstraction: persistence and coordination of jobs and triggers.
//!
//! The [`JobStore`] trait is the boundary between the engine and its state.
//! Every trigger state transition happens inside a store call, under the
//! store's locking discipline, so callers only ever see consistent
//! snapshots. Backends:
//!
//! - [`InMemoryJobStore`]: single node, one mutex is the lock
//! - [`SqliteJobStore`]: persistent, optionally clustered through
//!   lease-based row locks (`TRIGGER_ACCESS`, `STATE_ACCESS`)

pub mod cluster;
pub mod lock;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{ClusterSettings, SqliteJobStore};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core::calendar::SharedCalendar;
use crate::core::clock::{SharedClock, SystemClock};
use crate::core::job::JobDetail;
use crate::core::misfire::{MisfireHandler, SmartMisfirePolicy};
use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::types::{FireInstanceId, InstanceId, JobKey, TriggerKey};
use crate::scheduler::SchedulerSignaler;

/// Group that recovery triggers are created in.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

/// Paused-group marker meaning every group, including ones not yet created.
pub(crate) const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The item is still referenced and cannot be removed.
    #[error("in use: {0}")]
    InUse(String),

    /// The request is inconsistent with stored state.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A cluster lock could not be obtained in time.
    #[error("timed out acquiring lock {0}")]
    LockTimeout(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Error reported by the database.
    #[error("database error: {0}")]
    Database(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::LockTimeout(_) | StorageError::Database(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationError(e.to_string())
    }
}

/// Execution state of a trigger, owned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition when due.
    Waiting,
    /// Reserved by a fire loop, not yet fired.
    Acquired,
    /// Fired with no further fire time; its job is running.
    Executing,
    /// Finished; will never fire again.
    Complete,
    /// Withheld because its non-concurrent job is running.
    Blocked,
    /// Withheld after an error until reset.
    Error,
    /// Paused by a user.
    Paused,
    /// Paused while its job was blocked.
    PausedBlocked,
}

impl TriggerState {
    /// Stable string name used in persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Error => "ERROR",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
        }
    }

    /// Parse a persisted name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "WAITING" => TriggerState::Waiting,
            "ACQUIRED" => TriggerState::Acquired,
            "EXECUTING" => TriggerState::Executing,
            "COMPLETE" => TriggerState::Complete,
            "BLOCKED" => TriggerState::Blocked,
            "ERROR" => TriggerState::Error,
            "PAUSED" => TriggerState::Paused,
            "PAUSED_BLOCKED" => TriggerState::PausedBlocked,
            _ => return None,
        })
    }

    /// Whether this is one of the paused states.
    pub fn is_paused(&self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }

    /// State a trigger enters when it is stored or resumed.
    pub(crate) fn on_store(paused: bool, blocked: bool) -> Self {
        match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        }
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a fired-trigger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl FiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredState::Acquired => "ACQUIRED",
            FiredState::Executing => "EXECUTING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACQUIRED" => Some(FiredState::Acquired),
            "EXECUTING" => Some(FiredState::Executing),
            _ => None,
        }
    }
}

/// Ephemeral record of one firing, kept until completion for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: FireInstanceId,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: InstanceId,
    /// When the record was created or last moved to executing.
    pub fired_time: DateTime<Utc>,
    /// The trigger's fire time this record serves.
    pub scheduled_time: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredState,
    pub concurrent_execution_disallowed: bool,
    pub requests_recovery: bool,
}

/// Heartbeat row of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStateRecord {
    pub instance_id: InstanceId,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval: Duration,
}

impl SchedulerStateRecord {
    /// Whether the instance missed its checkin by more than `grace`.
    pub fn has_failed(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now - self.last_checkin > self.checkin_interval + grace
    }
}

/// A trigger reserved by [`JobStore::acquire_next_triggers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredTrigger {
    pub fire_instance_id: FireInstanceId,
    pub trigger: Trigger,
}

impl AcquiredTrigger {
    pub fn key(&self) -> &TriggerKey {
        self.trigger.key()
    }

    /// Fire time the trigger was acquired for.
    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        self.trigger.next_fire_time()
    }
}

/// Everything needed to run one firing.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub fire_instance_id: FireInstanceId,
    /// Trigger after the firing was recorded: its next fire time is already advanced.
    pub trigger: Trigger,
    pub job_detail: JobDetail,
    /// Whether this firing re-runs an execution lost in a crash.
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
}

/// Outcome of [`JobStore::trigger_fired`].
#[derive(Debug, Clone)]
pub enum TriggerFiredResult {
    /// Run the job.
    Fired(Box<TriggerFiredBundle>),
    /// The job disallows concurrent execution and is running; the trigger was parked as BLOCKED.
    Blocked,
    /// The trigger is no longer valid (deleted, paused or re-acquired concurrently).
    Gone,
}

/// Settings shared by every store backend.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub instance_id: InstanceId,
    pub instance_name: String,
    pub misfire_threshold: Duration,
    pub smart_misfire: SmartMisfirePolicy,
    /// Upper bound on misfires handled per acquisition pass.
    pub max_misfires_per_acquisition: usize,
    pub clock: SharedClock,
}

impl StoreSettings {
    pub(crate) fn misfire_handler(&self) -> MisfireHandler {
        MisfireHandler::new(self.misfire_threshold, self.smart_misfire.clone())
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::new("NON_CLUSTERED"),
            instance_name: "cadence".to_string(),
            misfire_threshold: Duration::seconds(60),
            smart_misfire: SmartMisfirePolicy::default(),
            max_misfires_per_acquisition: 20,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Side effects collected under the lock and delivered after it is released.
#[derive(Debug)]
pub(crate) enum Notice {
    Signal(Option<DateTime<Utc>>),
    Misfired(Trigger),
    Finalized(Trigger),
    JobDeleted(JobKey),
    Error(String),
}

/// Reject a set of triggers that names another job or repeats a key.
pub(crate) fn check_trigger_set(job: &JobDetail, triggers: &[Trigger]) -> Result<(), StorageError> {
    let mut seen = std::collections::HashSet::new();
    for trigger in triggers {
        if trigger.job_key() != job.key() {
            return Err(StorageError::Invalid(format!(
                "trigger {} is for job {}, not {}",
                trigger.key(),
                trigger.job_key(),
                job.key()
            )));
        }
        if !seen.insert(trigger.key()) {
            return Err(StorageError::DuplicateKey(format!("trigger: {}", trigger.key())));
        }
    }
    Ok(())
}

pub(crate) fn deliver(signaler: &dyn SchedulerSignaler, notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::Signal(t) => signaler.signal_scheduling_change(t),
            Notice::Misfired(t) => signaler.notify_trigger_misfired(&t),
            Notice::Finalized(t) => signaler.notify_trigger_finalized(&t),
            Notice::JobDeleted(k) => signaler.notify_job_deleted(&k),
            Notice::Error(m) => signaler.notify_scheduler_error(&m),
        }
    }
}

/// Persistence and coordination boundary of the scheduler.
///
/// All operations are atomic with respect to every other caller of the
/// same store, in-process or, for clustered stores, on other nodes.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Lifecycle

    /// Attach the scheduler's signaler. Called once before `scheduler_started`.
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StorageError>;

    /// The scheduler is starting; recover state left by crashed instances.
    async fn scheduler_started(&self) -> Result<(), StorageError>;

    /// The scheduler entered standby.
    async fn scheduler_paused(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// The scheduler left standby.
    async fn scheduler_resumed(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// The scheduler is shutting down.
    async fn shutdown(&self) -> Result<(), StorageError>;

    /// Whether state survives a process restart.
    fn supports_persistence(&self) -> bool;

    /// Whether several scheduler instances share this store.
    fn is_clustered(&self) -> bool {
        false
    }

    /// Identity of this node.
    fn instance_id(&self) -> InstanceId;

    /// The time source this store judges due and misfired triggers by.
    fn clock(&self) -> SharedClock;

    /// How often a clustered node should call [`checkin`](Self::checkin).
    fn checkin_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(7_500)
    }

    /// Extra time past the checkin interval before other nodes treat this one as failed.
    fn checkin_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(7_500)
    }

    /// Heartbeat. Clustered stores also recover failed instances here.
    async fn checkin(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // Jobs and triggers

    /// Store a job and a trigger for it atomically.
    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StorageError>;

    /// Store a job with all of its triggers. Either everything is stored or,
    /// on error, nothing is.
    async fn store_job_and_triggers(
        &self,
        job: JobDetail,
        triggers: Vec<Trigger>,
        replace: bool,
    ) -> Result<(), StorageError>;

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StorageError>;

    /// Store a trigger whose job already exists.
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StorageError>;

    /// Remove a job and all its triggers. Returns whether the job existed.
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StorageError>;

    /// Remove a trigger; a non-durable job left without triggers is removed too.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StorageError>;

    /// Replace a trigger with a new one for the same job.
    async fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<bool, StorageError>;

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StorageError>;

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StorageError>;

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StorageError>;

    /// All job keys, sorted.
    async fn job_keys(&self) -> Result<Vec<JobKey>, StorageError>;

    /// All trigger keys, sorted.
    async fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StorageError>;

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StorageError> {
        Ok(self.retrieve_job(key).await?.is_some())
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StorageError> {
        Ok(self.retrieve_trigger(key).await?.is_some())
    }

    /// Remove every job, trigger and calendar.
    async fn clear_all(&self) -> Result<(), StorageError>;

    // Calendars

    /// Store a calendar; optionally recompute fire times of triggers that reference it.
    async fn store_calendar(
        &self,
        name: &str,
        calendar: SharedCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), StorageError>;

    /// Remove a calendar. Fails while any trigger references it.
    async fn remove_calendar(&self, name: &str) -> Result<bool, StorageError>;

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<SharedCalendar>, StorageError>;

    async fn calendar_names(&self) -> Result<Vec<String>, StorageError>;

    // Trigger state

    /// Current state, `None` if the trigger does not exist.
    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, StorageError>;

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StorageError>;

    /// Resume a paused trigger, applying misfire handling if its time passed.
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StorageError>;

    async fn pause_job(&self, key: &JobKey) -> Result<(), StorageError>;

    async fn resume_job(&self, key: &JobKey) -> Result<(), StorageError>;

    /// Pause every trigger in a group, and any trigger later stored in it.
    async fn pause_trigger_group(&self, group: &str) -> Result<(), StorageError>;

    async fn resume_trigger_group(&self, group: &str) -> Result<(), StorageError>;

    async fn pause_all(&self) -> Result<(), StorageError>;

    async fn resume_all(&self) -> Result<(), StorageError>;

    async fn paused_trigger_groups(&self) -> Result<Vec<String>, StorageError>;

    /// Return a trigger in the ERROR state to normal scheduling.
    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StorageError>;

    // Firing

    /// Reserve due triggers.
    ///
    /// Returns waiting triggers whose next fire time is at or before
    /// `no_later_than`, ordered by (fire time, priority descending, key), at
    /// most `max_count`, with at most one trigger per non-concurrent job.
    /// Once the first trigger is chosen the batch only extends to
    /// `max(first fire time, now) + time_window`. Misfired triggers
    /// encountered on the way are handled under the same lock and are not
    /// returned unless their new fire time is due.
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>, StorageError>;

    /// Return an acquired, unfired trigger to WAITING.
    async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<(), StorageError>;

    /// Record that an acquired trigger is firing now.
    ///
    /// Re-validates the trigger under the acquisition lock.
    async fn trigger_fired(&self, acquired: &AcquiredTrigger) -> Result<TriggerFiredResult, StorageError>;

    /// Report that the job run by a firing finished.
    async fn trigger_completed(
        &self,
        trigger: &Trigger,
        fire_instance_id: FireInstanceId,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StorageError>;
}
