//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use crate::core::trigger::TriggerError;
use crate::storage::StorageError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors returned by the scheduling API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The trigger definition is invalid.
    #[error("invalid trigger: {0}")]
    Trigger(#[from] TriggerError),

    /// No job factory can build this job type.
    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Trigger not found.
    #[error("trigger not found: {0}")]
    TriggerNotFound(String),

    /// The request does not make sense.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The scheduler was shut down.
    #[error("scheduler is shut down")]
    Shutdown,

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Running but not firing triggers. Jobs can still be scheduled.
    Standby,
    /// Firing triggers.
    Started,
    /// Shutdown requested; draining.
    ShuttingDown,
    /// Stopped for good.
    Shutdown,
}

impl SchedulerState {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

/// Commands that can be sent to the fire loop.
pub(crate) enum SchedulerCommand {
    /// Begin (or resume) firing triggers.
    Start { response: oneshot::Sender<()> },
    /// Stop firing triggers; keep everything else running.
    Standby { response: oneshot::Sender<()> },
    /// Stop the scheduler.
    Shutdown {
        wait_for_jobs: bool,
        response: oneshot::Sender<()>,
    },
}
