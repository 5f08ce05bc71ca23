//! Jobs: the unit of work a trigger fires.
//!
//! A [`JobDetail`] is the persisted definition (key, job type name, flags,
//! data). The runnable [`Job`] is produced from it at fire time by a
//! [`JobFactory`], which the host application supplies. [`JobRegistry`] is
//! the stock factory: a map from job type names to constructors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::context::JobExecutionContext;
use super::types::JobKey;

/// Key/value payload carried by jobs and triggers.
pub type JobDataMap = HashMap<String, Value>;

/// Errors a job can report, and how the scheduler reacts to them.
#[derive(Debug, Error)]
pub enum JobError {
    /// Ordinary failure. The trigger continues on its normal schedule.
    #[error("job failed: {0}")]
    Failed(String),

    /// Recoverable failure; run the job again immediately.
    #[error("job requested re-execution: {0}")]
    Refire(String),

    /// Stop the trigger that fired this execution.
    #[error("job unscheduled its trigger: {0}")]
    UnscheduleTrigger(String),

    /// Stop every trigger of this job.
    #[error("job unscheduled all its triggers: {0}")]
    UnscheduleAllTriggers(String),

    /// The job observed cancellation and stopped early.
    #[error("job interrupted")]
    Interrupted,

    /// External command failed with exit code.
    #[error("command exited with code {0}")]
    CommandFailed(i32),

    /// The job could not be constructed from its definition.
    #[error("cannot instantiate job type '{0}'")]
    Instantiation(String),

    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Error reading typed data from the context.
    #[error("context error: {0}")]
    Context(#[from] super::context::ContextError),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// User work unit.
///
/// # Example
///
/// ```ignore
/// use cadence::{Job, JobError, JobExecutionContext};
/// use async_trait::async_trait;
///
/// struct SendReport;
///
/// #[async_trait]
/// impl Job for SendReport {
///     async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
///         let recipient: String = ctx.get("recipient")?;
///         if ctx.is_cancelled() {
///             return Err(JobError::Interrupted);
///         }
///         // ... send ...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Run one firing.
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError>;
}

/// Persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    key: JobKey,
    job_type: String,
    description: Option<String>,
    durable: bool,
    concurrent_execution_disallowed: bool,
    persist_data_after_execution: bool,
    requests_recovery: bool,
    data: JobDataMap,
}

impl JobDetail {
    /// Create a job definition whose behavior is looked up by `job_type`.
    pub fn new(key: impl Into<JobKey>, job_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            job_type: job_type.into(),
            description: None,
            durable: false,
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
            requests_recovery: false,
            data: JobDataMap::new(),
        }
    }

    /// Keep the job stored even when no trigger references it.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Serialize firings of this job through the BLOCKED trigger state.
    pub fn with_concurrent_execution_disallowed(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    /// Write the job's data map back to the store after each execution.
    pub fn with_persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    /// Re-run an execution interrupted by a crash when the cluster recovers it.
    pub fn with_requests_recovery(mut self, recovery: bool) -> Self {
        self.requests_recovery = recovery;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a single data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_data_map(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_concurrent_execution_disallowed(&self) -> bool {
        self.concurrent_execution_disallowed
    }

    pub fn is_persist_data_after_execution(&self) -> bool {
        self.persist_data_after_execution
    }

    pub fn requests_recovery(&self) -> bool {
        self.requests_recovery
    }

    pub fn data(&self) -> &JobDataMap {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut JobDataMap {
        &mut self.data
    }
}

/// Produces runnable jobs from definitions.
pub trait JobFactory: Send + Sync {
    /// Whether this factory can build jobs of the given type.
    fn supports(&self, job_type: &str) -> bool;

    /// Build the job for one firing.
    fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>, JobError>;
}

type Constructor = Arc<dyn Fn(&JobDetail) -> Result<Arc<dyn Job>, JobError> + Send + Sync>;

/// Map from job type names to constructors.
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: HashMap<String, Constructor>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("JobRegistry").field("types", &types).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `job_type`.
    pub fn register<F>(mut self, job_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&JobDetail) -> Result<Arc<dyn Job>, JobError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(job_type.into(), Arc::new(constructor));
        self
    }

    /// Register a shared instance used for every firing of `job_type`.
    pub fn register_instance(self, job_type: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.register(job_type, move |_| Ok(job.clone()))
    }

    /// Registered type names, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl JobFactory for JobRegistry {
    fn supports(&self, job_type: &str) -> bool {
        self.constructors.contains_key(job_type)
    }

    fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>, JobError> {
        let constructor = self
            .constructors
            .get(detail.job_type())
            .ok_or_else(|| JobError::Instantiation(detail.job_type().to_string()))?;
        constructor(detail)
    }
}
