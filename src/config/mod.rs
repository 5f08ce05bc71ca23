//! Configuration loading and parsing.
//!
//! [`SchedulerConfig`] is the typed engine configuration. The YAML file
//! format read by the `cadence` binary wraps it together with a list of
//! command jobs.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{build_scheduler, open_store, JobConfigBuilder};
pub use error::ConfigError;
pub use types::{SchedulerConfig, StorageConfig, AUTO_INSTANCE_ID};
pub use yaml::{CadenceFile, JobConfig, ScheduleConfig, TriggerConfig, YamlLoader};
