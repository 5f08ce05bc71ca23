//! cadence - a persistent, clusterable job scheduling engine.
//!
//! Jobs are units of work; triggers say when they run. A [`Scheduler`]
//! owns a fire-selection loop that acquires due triggers from a
//! [`JobStore`], fires them and hands the resulting jobs to a bounded
//! worker pool. With the SQLite store several scheduler instances can
//! share one database: each trigger fires on exactly one node and the
//! work of a crashed node is recovered by the survivors.
//!
//! ```no_run
//! use cadence::{CommandJob, InMemoryJobStore, JobDetail, Schedule, Scheduler, Trigger, COMMAND_JOB_TYPE};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (handle, task) = Scheduler::new(InMemoryJobStore::new()).start().await?;
//!
//! let command = CommandJob::builder("echo").arg("hello").build();
//! let job = JobDetail::new("greet", COMMAND_JOB_TYPE).with_data_map(command.to_job_data());
//! let trigger = Trigger::builder("every-minute", "greet")
//!     .with_schedule(Schedule::cron("0 * * * * *")?)
//!     .build()?;
//! handle.schedule_job(job, trigger).await?;
//!
//! handle.shutdown(true).await?;
//! task.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{CadenceFile, ConfigError, JobConfigBuilder, SchedulerConfig, StorageConfig, YamlLoader};
pub use core::calendar::{Calendar, RangeExclusionCalendar, SharedCalendar};
pub use core::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use core::context::{ContextError, JobExecutionContext};
pub use core::job::{Job, JobDataMap, JobDetail, JobError, JobFactory, JobRegistry};
pub use core::misfire::{MisfireInstruction, SmartMisfirePolicy};
pub use core::schedule::{
    CalendarIntervalSchedule, CronSchedule, DailyTimeIntervalSchedule, IntervalUnit, Repeat,
    Schedule, ScheduleError, SimpleSchedule,
};
pub use core::trigger::{CompletedExecutionInstruction, Trigger, TriggerBuilder, TriggerError};
pub use core::types::{FireInstanceId, InstanceId, JobKey, TriggerKey, DEFAULT_GROUP};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use execution::{CommandJob, CommandJobBuilder, ExecutingJob, WorkerPool, COMMAND_JOB_TYPE};
pub use scheduler::{
    Scheduler, SchedulerDirectory, SchedulerError, SchedulerHandle, SchedulerSignaler,
    SchedulerState, MANUAL_TRIGGER_GROUP,
};
pub use storage::{InMemoryJobStore, JobStore, StorageError, StoreSettings, TriggerState};
#[cfg(feature = "sqlite")]
pub use storage::{ClusterSettings, SqliteJobStore};
