//! Turns configuration into engine objects.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::error::ConfigError;
use super::types::{SchedulerConfig, StorageConfig};
use super::yaml::{JobConfig, ScheduleConfig, TriggerConfig};
use crate::core::job::JobDetail;
use crate::core::schedule::{CalendarIntervalSchedule, DailyTimeIntervalSchedule, Repeat, Schedule};
use crate::core::trigger::Trigger;
use crate::core::types::{JobKey, TriggerKey};
use crate::execution::CommandJob;
use crate::scheduler::Scheduler;
#[cfg(feature = "sqlite")]
use crate::storage::SqliteJobStore;
use crate::storage::{InMemoryJobStore, JobStore};

/// Builds command jobs and their triggers from [`JobConfig`]s.
pub struct JobConfigBuilder;

impl JobConfigBuilder {
    /// Build the job detail and triggers of one configured job.
    ///
    /// Triggers without `start_at` start at `now`.
    pub fn build(
        config: &JobConfig,
        now: DateTime<Utc>,
    ) -> Result<(JobDetail, Vec<Trigger>), ConfigError> {
        let mut command = CommandJob::builder(config.command.clone()).args(config.args.clone());
        for (key, value) in &config.env {
            command = command.env(key.clone(), value.clone());
        }
        if let Some(dir) = &config.working_dir {
            command = command.working_dir(dir.clone());
        }
        if let Some(secs) = config.timeout_secs {
            command = command.timeout(std::time::Duration::from_secs(secs));
        }
        let command = command.build();

        // configured entries first so the command keys cannot be shadowed
        let mut data = config.data.clone();
        data.extend(command.to_job_data());

        let job_key = JobKey::new(config.name.clone(), config.group.clone());
        let mut detail = JobDetail::new(job_key.clone(), crate::execution::COMMAND_JOB_TYPE)
            .with_durable(config.durable)
            .with_concurrent_execution_disallowed(config.disallow_concurrent)
            .with_persist_data_after_execution(config.persist_data)
            .with_requests_recovery(config.requests_recovery)
            .with_data_map(data);
        if let Some(description) = &config.description {
            detail = detail.with_description(description.clone());
        }

        let triggers = config
            .triggers
            .iter()
            .map(|t| Self::build_trigger(t, &job_key, now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((detail, triggers))
    }

    fn build_trigger(
        config: &TriggerConfig,
        job_key: &JobKey,
        now: DateTime<Utc>,
    ) -> Result<Trigger, ConfigError> {
        let key = TriggerKey::new(config.name.clone(), config.group.clone());
        let mut builder = Trigger::builder(key, job_key.clone())
            .with_schedule(Self::build_schedule(&config.schedule)?)
            .starting_at(config.start_at.unwrap_or(now))
            .with_data_map(config.data.clone());
        if let Some(priority) = config.priority {
            builder = builder.with_priority(priority);
        }
        if let Some(end) = config.end_at {
            builder = builder.ending_at(end);
        }
        if let Some(calendar) = &config.calendar {
            builder = builder.with_calendar(calendar.clone());
        }
        if let Some(misfire) = config.misfire {
            builder = builder.with_misfire_instruction(misfire);
        }
        if let Some(description) = &config.description {
            builder = builder.with_description(description.clone());
        }
        builder.build().map_err(|e| {
            ConfigError::InvalidConfig(format!("trigger '{}': {}", config.name, e))
        })
    }

    /// Convert a schedule definition, checking its parameters.
    pub fn build_schedule(config: &ScheduleConfig) -> Result<Schedule, ConfigError> {
        let repeat = |count: &Option<u32>| count.map(Repeat::Count).unwrap_or(Repeat::Forever);
        let schedule = match config {
            ScheduleConfig::Once => Schedule::once(),
            ScheduleConfig::Simple {
                interval_ms,
                repeat_count,
            } => Schedule::every(chrono::Duration::milliseconds(*interval_ms), repeat(repeat_count)),
            ScheduleConfig::Cron {
                expression,
                timezone,
            } => Schedule::cron_in(expression.clone(), timezone.as_deref().unwrap_or("UTC"))
                .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?,
            ScheduleConfig::CalendarInterval {
                unit,
                interval,
                timezone,
            } => {
                let mut schedule = CalendarIntervalSchedule::new(*unit, *interval);
                if let Some(tz) = timezone {
                    schedule = schedule.in_timezone(tz.clone());
                }
                Schedule::CalendarInterval(schedule)
            }
            ScheduleConfig::DailyTimeInterval {
                start,
                end,
                days,
                unit,
                interval,
                repeat_count,
                timezone,
            } => {
                let mut schedule = DailyTimeIntervalSchedule::new(*start, *end, *unit, *interval)
                    .with_repeat(repeat(repeat_count));
                if !days.is_empty() {
                    schedule = schedule.on_days(days.iter().copied());
                }
                if let Some(tz) = timezone {
                    schedule = schedule.in_timezone(tz.clone());
                }
                Schedule::DailyTimeInterval(schedule)
            }
        };
        schedule
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        Ok(schedule)
    }
}

/// Open the job store named by the configuration.
pub async fn open_store(config: &SchedulerConfig) -> Result<Arc<dyn JobStore>, ConfigError> {
    config.validate()?;
    let settings = config.store_settings(config.resolve_instance_id());
    let store: Arc<dyn JobStore> = match &config.storage {
        StorageConfig::Memory => Arc::new(InMemoryJobStore::with_settings(settings)),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!(path = %path, clustered = config.clustered, "opening sqlite job store");
            Arc::new(SqliteJobStore::open(path, settings, config.cluster_settings()).await?)
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            return Err(ConfigError::InvalidConfig(
                "this build has no sqlite support".into(),
            ))
        }
    };
    Ok(store)
}

/// Open the configured store and apply the engine settings to a [`Scheduler`].
pub async fn build_scheduler(config: &SchedulerConfig) -> Result<Scheduler, ConfigError> {
    let store = open_store(config).await?;
    Ok(Scheduler::with_store(store)
        .with_name(config.instance_name.clone())
        .with_thread_count(config.thread_count)
        .with_batch(config.batch_max_count, config.batch_time_window())
        .with_idle_wait(config.idle_wait())
        .with_db_failure_retry_interval(config.db_failure_retry_interval())
        .with_shutdown_timeout(config.shutdown_timeout())
        .with_interrupt_jobs_on_shutdown(config.interrupt_jobs_on_shutdown)
        .with_start_in_standby(config.start_in_standby))
}
