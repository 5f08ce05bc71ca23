//! Configuration type definitions.
//!
//! [`SchedulerConfig`] is the flat engine configuration. Every field has a
//! default, so an empty YAML mapping is a valid configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::clock::SystemClock;
use crate::core::misfire::SmartMisfirePolicy;
use crate::core::types::InstanceId;
#[cfg(feature = "sqlite")]
use crate::storage::ClusterSettings;
use crate::storage::StoreSettings;

/// Instance id value that asks for a generated `<hostname>-<millis>` id.
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub instance_name: String,
    /// Cluster-unique id, or `AUTO`.
    pub instance_id: String,
    /// Worker pool size.
    pub thread_count: usize,
    /// How late a trigger may be before it counts as misfired.
    pub misfire_threshold_ms: u64,
    /// Most triggers acquired in one pass.
    pub batch_max_count: usize,
    /// How far past the earliest trigger a batch may reach.
    pub batch_time_window_ms: u64,
    /// Longest sleep when nothing is due.
    pub idle_wait_ms: u64,
    /// Pause after a failed store call.
    pub db_failure_retry_interval_ms: u64,
    pub clustered: bool,
    pub checkin_interval_ms: u64,
    pub checkin_grace_ms: u64,
    pub lock_lease_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_misfires_per_acquisition: usize,
    pub interrupt_jobs_on_shutdown: bool,
    pub shutdown_timeout_secs: u64,
    pub start_in_standby: bool,
    pub smart_misfire: SmartMisfirePolicy,
    pub storage: StorageConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "cadence".to_string(),
            instance_id: AUTO_INSTANCE_ID.to_string(),
            thread_count: 10,
            misfire_threshold_ms: 60_000,
            batch_max_count: 1,
            batch_time_window_ms: 0,
            idle_wait_ms: 30_000,
            db_failure_retry_interval_ms: 15_000,
            clustered: false,
            checkin_interval_ms: 7_500,
            checkin_grace_ms: 7_500,
            lock_lease_ms: 30_000,
            lock_timeout_ms: 10_000,
            max_misfires_per_acquisition: 20,
            interrupt_jobs_on_shutdown: false,
            shutdown_timeout_secs: 30,
            start_in_standby: false,
            smart_misfire: SmartMisfirePolicy::default(),
            storage: StorageConfig::Memory,
        }
    }
}

impl SchedulerConfig {
    /// Check every value before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_name.trim().is_empty() {
            return Err(ConfigError::MissingField("instance_name".into()));
        }
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::MissingField("instance_id".into()));
        }
        let positive = [
            ("thread_count", self.thread_count as u64),
            ("misfire_threshold_ms", self.misfire_threshold_ms),
            ("batch_max_count", self.batch_max_count as u64),
            ("idle_wait_ms", self.idle_wait_ms),
            ("db_failure_retry_interval_ms", self.db_failure_retry_interval_ms),
            ("checkin_interval_ms", self.checkin_interval_ms),
            ("lock_lease_ms", self.lock_lease_ms),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("max_misfires_per_acquisition", self.max_misfires_per_acquisition as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!("{} must be greater than zero", field)));
            }
        }
        if i64::try_from(self.misfire_threshold_ms).is_err()
            || i64::try_from(self.batch_time_window_ms).is_err()
        {
            return Err(ConfigError::InvalidConfig("duration out of range".into()));
        }
        if self.lock_lease_ms <= self.lock_timeout_ms {
            return Err(ConfigError::InvalidConfig(
                "lock_lease_ms must exceed lock_timeout_ms".into(),
            ));
        }
        self.smart_misfire
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        match &self.storage {
            StorageConfig::Memory if self.clustered => Err(ConfigError::InvalidConfig(
                "clustering requires a persistent store".into(),
            )),
            StorageConfig::Sqlite { path } if path.trim().is_empty() => {
                Err(ConfigError::MissingField("storage.path".into()))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { .. } => Err(ConfigError::InvalidConfig(
                "this build has no sqlite support".into(),
            )),
            _ => Ok(()),
        }
    }

    /// The instance id, generating one if configured as `AUTO`.
    pub fn resolve_instance_id(&self) -> InstanceId {
        if self.instance_id == AUTO_INSTANCE_ID {
            InstanceId::generate()
        } else {
            InstanceId::new(self.instance_id.clone())
        }
    }

    /// Store settings for the given instance id.
    pub fn store_settings(&self, instance_id: InstanceId) -> StoreSettings {
        StoreSettings {
            instance_id,
            instance_name: self.instance_name.clone(),
            misfire_threshold: chrono::Duration::milliseconds(self.misfire_threshold_ms as i64),
            smart_misfire: self.smart_misfire.clone(),
            max_misfires_per_acquisition: self.max_misfires_per_acquisition,
            clock: Arc::new(SystemClock),
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            clustered: self.clustered,
            checkin_interval: Duration::from_millis(self.checkin_interval_ms),
            checkin_grace: Duration::from_millis(self.checkin_grace_ms),
            lock_lease: Duration::from_millis(self.lock_lease_ms),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn batch_time_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.batch_time_window_ms as i64)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn db_failure_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_failure_retry_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
