//! Job execution.
//!
//! The worker pool bounds how many jobs run at once, the run shell drives
//! one firing from instantiation to completion reporting, and
//! [`CommandJob`] is the stock job for running external programs.

mod command;
mod pool;
mod shell;

pub use command::{CommandJob, CommandJobBuilder, COMMAND_JOB_TYPE};
pub use pool::{PoolError, WorkerPool};
pub use shell::ExecutingJob;
pub(crate) use shell::{ExecutingJobs, JobRunShell, ShellEnvironment};
