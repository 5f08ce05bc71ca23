//! YAML configuration parsing.
//!
//! A configuration file holds the engine settings under `scheduler:` and
//! a list of command jobs, each with its triggers, under `jobs:`.
//!
//! ```yaml
//! scheduler:
//!   instance_name: nightly
//!   storage:
//!     type: sqlite
//!     path: cadence.db
//! jobs:
//!   - name: backup
//!     command: /usr/local/bin/backup
//!     args: ["--full"]
//!     triggers:
//!       - name: every-night
//!         schedule:
//!           type: cron
//!           expression: "0 0 2 * * *"
//! ```

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use super::error::ConfigError;
use super::types::SchedulerConfig;
use crate::core::misfire::MisfireInstruction;
use crate::core::schedule::IntervalUnit;
use crate::core::types::DEFAULT_GROUP;

/// A whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceFile {
    pub scheduler: SchedulerConfig,
    pub jobs: Vec<JobConfig>,
}

/// A command job and its triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub description: Option<String>,
    /// Program to run.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    /// Kill the command after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Keep the job after its last trigger is gone.
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub disallow_concurrent: bool,
    #[serde(default)]
    pub persist_data: bool,
    /// Re-run after a crash of the node executing it.
    #[serde(default)]
    pub requests_recovery: bool,
    /// Extra entries for the job data map.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

/// A trigger of a configured job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub description: Option<String>,
    pub priority: Option<i32>,
    /// Defaults to the time the file is loaded.
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub calendar: Option<String>,
    pub misfire: Option<MisfireInstruction>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub schedule: ScheduleConfig,
}

/// Schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Fire a single time at the start time.
    Once,
    /// Fixed interval. Without `repeat_count` it repeats forever.
    Simple {
        interval_ms: i64,
        repeat_count: Option<u32>,
    },
    /// Cron expression or shortcut.
    Cron {
        expression: String,
        timezone: Option<String>,
    },
    /// Every N calendar units.
    CalendarInterval {
        unit: IntervalUnit,
        interval: u32,
        timezone: Option<String>,
    },
    /// Every N units inside a daily window.
    DailyTimeInterval {
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        days: Vec<Weekday>,
        unit: IntervalUnit,
        interval: u32,
        repeat_count: Option<u32>,
        timezone: Option<String>,
    },
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Loads and validates configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<CadenceFile, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let file: CadenceFile =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&file)?;
        Ok(file)
    }

    /// Parse a configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<CadenceFile, ConfigError> {
        let file: CadenceFile = serde_yaml::from_str(yaml)?;
        Self::validate(&file)?;
        Ok(file)
    }

    /// Validate settings and job definitions.
    pub fn validate(file: &CadenceFile) -> Result<(), ConfigError> {
        file.scheduler.validate()?;

        let mut job_keys = HashSet::new();
        let mut trigger_keys = HashSet::new();
        for job in &file.jobs {
            Self::validate_job(job)?;
            if !job_keys.insert((job.group.as_str(), job.name.as_str())) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate job '{}.{}'",
                    job.group, job.name
                )));
            }
            for trigger in &job.triggers {
                if !trigger_keys.insert((trigger.group.as_str(), trigger.name.as_str())) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "duplicate trigger '{}.{}'",
                        trigger.group, trigger.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_job(job: &JobConfig) -> Result<(), ConfigError> {
        if job.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }
        if job.command.trim().is_empty() {
            return Err(ConfigError::MissingField(format!("command of job '{}'", job.name)));
        }
        if job.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(format!(
                "timeout_secs of job '{}' cannot be zero",
                job.name
            )));
        }
        if job.triggers.is_empty() && !job.durable {
            return Err(ConfigError::InvalidConfig(format!(
                "job '{}' has no triggers and is not durable",
                job.name
            )));
        }

        for trigger in &job.triggers {
            if trigger.name.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "name of a trigger of job '{}'",
                    job.name
                )));
            }
            if let (Some(start), Some(end)) = (trigger.start_at, trigger.end_at) {
                if end < start {
                    return Err(ConfigError::InvalidConfig(format!(
                        "trigger '{}' ends before it starts",
                        trigger.name
                    )));
                }
            }
            match &trigger.schedule {
                ScheduleConfig::Simple { interval_ms, .. } if *interval_ms <= 0 => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "trigger '{}' needs a positive interval_ms",
                        trigger.name
                    )));
                }
                ScheduleConfig::CalendarInterval { interval: 0, .. }
                | ScheduleConfig::DailyTimeInterval { interval: 0, .. } => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "trigger '{}' needs a positive interval",
                        trigger.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StorageConfig;

    #[test]
    fn test_parse_full_file() {
        let yaml = r#"
scheduler:
  instance_name: nightly
  instance_id: node-1
  thread_count: 4
  storage:
    type: sqlite
    path: /tmp/cadence.db
jobs:
  - name: backup
    group: ops
    command: /usr/local/bin/backup
    args: ["--full"]
    env:
      LEVEL: "9"
    timeout_secs: 600
    disallow_concurrent: true
    data:
      retention: 7
    triggers:
      - name: nightly
        priority: 10
        misfire: do_nothing
        schedule:
          type: cron
          expression: "0 0 2 * * *"
          timezone: Europe/Berlin
      - name: hourly
        schedule:
          type: simple
          interval_ms: 3600000
"#;
        let file = YamlLoader::parse(yaml).unwrap();
        assert_eq!(file.scheduler.instance_name, "nightly");
        assert_eq!(file.scheduler.thread_count, 4);
        assert_eq!(
            file.scheduler.storage,
            StorageConfig::Sqlite {
                path: "/tmp/cadence.db".into()
            }
        );
        // untouched fields keep their defaults
        assert_eq!(file.scheduler.idle_wait_ms, 30_000);

        let job = &file.jobs[0];
        assert_eq!(job.group, "ops");
        assert!(job.disallow_concurrent);
        assert_eq!(job.data["retention"], serde_json::json!(7));
        assert_eq!(job.triggers.len(), 2);
        assert_eq!(job.triggers[0].group, DEFAULT_GROUP);
        assert_eq!(job.triggers[0].misfire, Some(MisfireInstruction::DoNothing));
        assert_eq!(
            job.triggers[1].schedule,
            ScheduleConfig::Simple {
                interval_ms: 3_600_000,
                repeat_count: None
            }
        );
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = YamlLoader::parse("{}").unwrap();
        assert!(file.jobs.is_empty());
        assert_eq!(file.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_daily_window_schedule() {
        let yaml = r#"
jobs:
  - name: poll
    command: "true"
    triggers:
      - name: office-hours
        schedule:
          type: daily_time_interval
          start: "09:00:00"
          end: "17:00:00"
          days: [Mon, Tue, Wed, Thu, Fri]
          unit: minute
          interval: 15
"#;
        let file = YamlLoader::parse(yaml).unwrap();
        match &file.jobs[0].triggers[0].schedule {
            ScheduleConfig::DailyTimeInterval { days, unit, .. } => {
                assert_eq!(days.len(), 5);
                assert_eq!(*unit, IntervalUnit::Minute);
            }
            other => panic!("unexpected schedule {:?}", other),
        }
    }

    #[test]
    fn test_missing_command_rejected() {
        let yaml = r#"
jobs:
  - name: nothing
    command: ""
    durable: true
"#;
        let result = YamlLoader::parse(yaml);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_job_without_triggers_must_be_durable() {
        let yaml = r#"
jobs:
  - name: adhoc
    command: echo
"#;
        assert!(YamlLoader::parse(yaml).is_err());

        let yaml = r#"
jobs:
  - name: adhoc
    command: echo
    durable: true
"#;
        assert!(YamlLoader::parse(yaml).is_ok());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let yaml = r#"
jobs:
  - name: a
    command: echo
    durable: true
  - name: a
    command: echo
    durable: true
"#;
        let err = YamlLoader::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate job"));

        let yaml = r#"
jobs:
  - name: a
    command: echo
    triggers:
      - name: t
        schedule: { type: once }
  - name: b
    command: echo
    triggers:
      - name: t
        schedule: { type: once }
"#;
        let err = YamlLoader::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate trigger"));
    }

    #[test]
    fn test_bad_interval_rejected() {
        let yaml = r#"
jobs:
  - name: a
    command: echo
    triggers:
      - name: t
        schedule:
          type: simple
          interval_ms: 0
"#;
        assert!(YamlLoader::parse(yaml).is_err());
    }

    #[test]
    fn test_invalid_scheduler_settings_rejected() {
        let yaml = r#"
scheduler:
  thread_count: 0
"#;
        assert!(matches!(
            YamlLoader::parse(yaml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "jobs: [").unwrap();
        match YamlLoader::load(&path) {
            Err(ConfigError::YamlFileError { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected result {:?}", other),
        }

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            YamlLoader::load(&missing),
            Err(ConfigError::FileReadError { .. })
        ));
    }
}
