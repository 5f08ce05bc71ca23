//! Per-firing execution context handed to [`Job::execute`](super::job::Job::execute).
//!
//! The context carries a snapshot of the trigger and job definition at fire
//! time, the merged data map (job data overlaid with trigger data), fire
//! times, recovery information, and a cancellation token for cooperative
//! interruption.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::clock::from_millis;
use super::job::{JobDataMap, JobDetail};
use super::trigger::Trigger;
use super::types::{FireInstanceId, TriggerKey};

/// Data key holding the name of the trigger whose firing is being recovered.
pub const RECOVERING_TRIGGER_NAME: &str = "cadence.recovering.trigger_name";
/// Data key holding the group of the trigger whose firing is being recovered.
pub const RECOVERING_TRIGGER_GROUP: &str = "cadence.recovering.trigger_group";
/// Data key holding the original fire time (epoch millis) of a recovered firing.
pub const RECOVERING_FIRE_TIME: &str = "cadence.recovering.fire_time_ms";
/// Data key holding the original scheduled fire time (epoch millis) of a recovered firing.
pub const RECOVERING_SCHEDULED_FIRE_TIME: &str = "cadence.recovering.scheduled_fire_time_ms";

/// Errors that can occur when reading or writing context data.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Key was not found in the context.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Failed to deserialize value from context.
    #[error("deserialization error for key '{key}': {message}")]
    DeserializationError { key: String, message: String },

    /// Failed to serialize value for context.
    #[error("serialization error for key '{key}': {message}")]
    SerializationError { key: String, message: String },
}

/// Everything a job sees about the firing it is running.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    fire_instance_id: FireInstanceId,
    trigger: Trigger,
    job_detail: JobDetail,
    merged_data: JobDataMap,
    fire_time: DateTime<Utc>,
    scheduled_fire_time: Option<DateTime<Utc>>,
    recovering: bool,
    refire_count: u32,
    cancel: CancellationToken,
    result: Option<Value>,
}

impl JobExecutionContext {
    /// Build a context for one firing.
    pub fn new(
        fire_instance_id: FireInstanceId,
        trigger: Trigger,
        job_detail: JobDetail,
        fire_time: DateTime<Utc>,
        scheduled_fire_time: Option<DateTime<Utc>>,
        recovering: bool,
    ) -> Self {
        let mut merged_data = job_detail.data().clone();
        merged_data.extend(trigger.data().iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            fire_instance_id,
            trigger,
            job_detail,
            merged_data,
            fire_time,
            scheduled_fire_time,
            recovering,
            refire_count: 0,
            cancel: CancellationToken::new(),
            result: None,
        }
    }

    pub fn fire_instance_id(&self) -> FireInstanceId {
        self.fire_instance_id
    }

    /// Snapshot of the trigger as it was when it fired.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn job_detail(&self) -> &JobDetail {
        &self.job_detail
    }

    /// When the firing actually happened.
    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    /// When the firing was scheduled to happen.
    pub fn scheduled_fire_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.trigger.previous_fire_time()
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.trigger.next_fire_time()
    }

    /// How many times this firing was re-executed at the job's request.
    pub fn refire_count(&self) -> u32 {
        self.refire_count
    }

    pub(crate) fn increment_refire_count(&mut self) {
        self.refire_count += 1;
    }

    /// Whether this firing re-runs an execution lost in a crash.
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Key of the trigger whose crashed firing is being recovered.
    pub fn recovering_trigger_key(&self) -> Option<TriggerKey> {
        if !self.recovering {
            return None;
        }
        let name = self.merged_data.get(RECOVERING_TRIGGER_NAME)?.as_str()?;
        let group = self.merged_data.get(RECOVERING_TRIGGER_GROUP)?.as_str()?;
        Some(TriggerKey::new(name, group))
    }

    /// Original fire time of the crashed firing being recovered.
    pub fn recovering_fire_time(&self) -> Option<DateTime<Utc>> {
        if !self.recovering {
            return None;
        }
        self.merged_data
            .get(RECOVERING_FIRE_TIME)?
            .as_i64()
            .map(from_millis)
    }

    /// Merged data map: job data overlaid with trigger data.
    pub fn data(&self) -> &JobDataMap {
        &self.merged_data
    }

    /// Read a typed value from the merged data.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self
            .merged_data
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| ContextError::DeserializationError {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Read a typed value, returning `None` when missing or mistyped.
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).ok()
    }

    /// Write into the job's own data map.
    ///
    /// The change is visible in [`data`](Self::data) immediately and is
    /// written back to the store only when the job persists its data after
    /// execution.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), ContextError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.job_detail.data_mut().insert(key.clone(), value.clone());
        self.merged_data.insert(key, value);
        Ok(())
    }

    /// Attach a result value for listeners.
    pub fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Token cancelled when the job is interrupted or the scheduler shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> JobExecutionContext {
        let trigger = Trigger::builder("t", "j")
            .with_data("shared", "from-trigger")
            .with_data("only_trigger", 1)
            .starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .build()
            .unwrap();
        let job = JobDetail::new("j", "noop")
            .with_data("shared", "from-job")
            .with_data("only_job", true);
        JobExecutionContext::new(FireInstanceId::new(), trigger, job, Utc::now(), None, false)
    }

    #[test]
    fn test_trigger_data_overrides_job_data() {
        let ctx = context();
        let shared: String = ctx.get("shared").unwrap();
        assert_eq!(shared, "from-trigger");
        assert!(ctx.get::<bool>("only_job").unwrap());
        assert_eq!(ctx.get::<i32>("only_trigger").unwrap(), 1);
    }

    #[test]
    fn test_missing_key() {
        let ctx = context();
        assert!(matches!(ctx.get::<String>("absent"), Err(ContextError::KeyNotFound(_))));
        assert_eq!(ctx.get_optional::<String>("absent"), None);
    }

    #[test]
    fn test_put_updates_job_data() {
        let mut ctx = context();
        ctx.put("counter", 3).unwrap();
        assert_eq!(ctx.get::<i32>("counter").unwrap(), 3);
        assert_eq!(ctx.job_detail().data().get("counter"), Some(&Value::from(3)));
    }

    #[test]
    fn test_cancellation_is_observable() {
        let ctx = context();
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_not_recovering_has_no_recovery_info() {
        let ctx = context();
        assert!(!ctx.is_recovering());
        assert!(ctx.recovering_trigger_key().is_none());
        assert!(ctx.recovering_fire_time().is_none());
    }
}
