//! External command jobs.
//!
//! [`CommandJob`] runs an external program as a job. Its definition lives
//! entirely in the job's data map, so it survives a round trip through a
//! persistent store and can be declared in YAML:
//!
//! | key            | type              |
//! |----------------|-------------------|
//! | `command`      | string (required) |
//! | `args`         | list of strings   |
//! | `env`          | map of strings    |
//! | `working_dir`  | string            |
//! | `timeout_secs` | number            |
//!
//! # Example
//!
//! ```rust
//! use cadence::{CommandJob, JobDetail};
//! use std::time::Duration;
//!
//! let command = CommandJob::builder("pg_dump")
//!     .args(["--format=custom", "warehouse"])
//!     .env("PGHOST", "db.internal")
//!     .timeout(Duration::from_secs(600))
//!     .build();
//!
//! let detail = JobDetail::new("nightly-backup", cadence::COMMAND_JOB_TYPE)
//!     .with_data_map(command.to_job_data());
//! assert_eq!(CommandJob::from_detail(&detail).unwrap(), command);
//! ```
//!
//! The captured stdout, stderr and exit code are stored as the execution
//! result. A non-zero exit becomes [`JobError::CommandFailed`]; hitting
//! the timeout or being interrupted kills the child process.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::context::JobExecutionContext;
use crate::core::job::{Job, JobDataMap, JobDetail, JobError, JobRegistry};

/// Job type name under which [`CommandJob`] is registered.
pub const COMMAND_JOB_TYPE: &str = "command";

const KEY_COMMAND: &str = "command";
const KEY_ARGS: &str = "args";
const KEY_ENV: &str = "env";
const KEY_WORKING_DIR: &str = "working_dir";
const KEY_TIMEOUT: &str = "timeout_secs";

/// A job that executes an external command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandJob {
    pub fn builder(program: impl Into<String>) -> CommandJobBuilder {
        CommandJobBuilder::new(program)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Encode this command as job data.
    pub fn to_job_data(&self) -> JobDataMap {
        let mut data = JobDataMap::new();
        data.insert(KEY_COMMAND.into(), json!(self.program));
        if !self.args.is_empty() {
            data.insert(KEY_ARGS.into(), json!(self.args));
        }
        if !self.env.is_empty() {
            data.insert(KEY_ENV.into(), json!(self.env));
        }
        if let Some(dir) = &self.working_dir {
            data.insert(KEY_WORKING_DIR.into(), json!(dir.to_string_lossy()));
        }
        if let Some(timeout) = self.timeout {
            data.insert(KEY_TIMEOUT.into(), json!(timeout.as_secs_f64()));
        }
        data
    }

    /// Decode a command from a job's data map.
    pub fn from_detail(detail: &JobDetail) -> Result<Self, JobError> {
        Self::from_data(detail.data())
    }

    fn from_data(data: &JobDataMap) -> Result<Self, JobError> {
        let invalid = |what: &str| JobError::Instantiation(format!("{}: invalid '{}'", COMMAND_JOB_TYPE, what));

        let program = data
            .get(KEY_COMMAND)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid(KEY_COMMAND))?
            .to_string();
        let args = match data.get(KEY_ARGS) {
            Some(v) => serde_json::from_value(v.clone()).map_err(|_| invalid(KEY_ARGS))?,
            None => Vec::new(),
        };
        let env = match data.get(KEY_ENV) {
            Some(v) => serde_json::from_value(v.clone()).map_err(|_| invalid(KEY_ENV))?,
            None => BTreeMap::new(),
        };
        let working_dir = match data.get(KEY_WORKING_DIR) {
            Some(v) => Some(PathBuf::from(v.as_str().ok_or_else(|| invalid(KEY_WORKING_DIR))?)),
            None => None,
        };
        let timeout = match data.get(KEY_TIMEOUT) {
            Some(v) => {
                let secs = v
                    .as_f64()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| invalid(KEY_TIMEOUT))?;
                Some(Duration::from_secs_f64(secs))
            }
            None => None,
        };

        Ok(Self {
            program,
            args,
            env,
            working_dir,
            timeout,
        })
    }
}

#[async_trait]
impl Job for CommandJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, args = ?self.args, "spawning command");
        let child = cmd
            .spawn()
            .map_err(|e| JobError::Failed(format!("cannot start '{}': {}", self.program, e)))?;

        let cancel = ctx.cancellation_token();
        let wait = child.wait_with_output();
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Interrupted),
            output = async {
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, wait)
                        .await
                        .map_err(|_| JobError::Failed(format!("timed out after {:?}", limit)))?,
                    None => wait.await,
                }
                .map_err(|e| JobError::Failed(e.to_string()))
            } => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);
        let job = ctx.job_detail().key();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!(job = %job, "stdout: {}", line);
        }
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(job = %job, "stderr: {}", line);
        }
        ctx.set_result(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": code,
        }));

        if output.status.success() {
            Ok(())
        } else {
            Err(JobError::CommandFailed(code))
        }
    }
}

/// Builder for [`CommandJob`].
#[derive(Debug, Clone)]
pub struct CommandJobBuilder {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandJobBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn build(self) -> CommandJob {
        CommandJob {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            timeout: self.timeout,
        }
    }
}

impl JobRegistry {
    /// Register [`CommandJob`] under [`COMMAND_JOB_TYPE`].
    pub fn with_command_jobs(self) -> Self {
        self.register(COMMAND_JOB_TYPE, |detail| {
            Ok(Arc::new(CommandJob::from_detail(detail)?) as Arc<dyn Job>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobFactory;
    use crate::core::trigger::Trigger;
    use crate::core::types::FireInstanceId;
    use chrono::Utc;

    fn context_for(job: &CommandJob) -> JobExecutionContext {
        let detail = JobDetail::new("cmd", COMMAND_JOB_TYPE).with_data_map(job.to_job_data());
        let trigger = Trigger::builder("t", "cmd").build().unwrap();
        JobExecutionContext::new(FireInstanceId::new(), trigger, detail, Utc::now(), None, false)
    }

    #[test]
    fn test_builder_sets_fields() {
        let job = CommandJob::builder("echo")
            .arg("hello")
            .args(["big", "world"])
            .working_dir("/tmp")
            .timeout(Duration::from_secs(3))
            .build();

        assert_eq!(job.program(), "echo");
        assert_eq!(job.args(), &["hello", "big", "world"]);
        assert_eq!(job.working_dir(), Some(&PathBuf::from("/tmp")));
        assert_eq!(job.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_from_data_rejects_missing_command() {
        let detail = JobDetail::new("cmd", COMMAND_JOB_TYPE).with_data("args", json!(["x"]));
        assert!(matches!(
            CommandJob::from_detail(&detail),
            Err(JobError::Instantiation(_))
        ));
    }

    #[test]
    fn test_from_data_rejects_bad_timeout() {
        let detail = JobDetail::new("cmd", COMMAND_JOB_TYPE)
            .with_data("command", "true")
            .with_data("timeout_secs", -1);
        assert!(CommandJob::from_detail(&detail).is_err());
    }

    #[test]
    fn test_registry_builds_command_jobs() {
        let registry = JobRegistry::new().with_command_jobs();
        assert!(registry.supports(COMMAND_JOB_TYPE));

        let detail = JobDetail::new("cmd", COMMAND_JOB_TYPE).with_data("command", "true");
        assert!(registry.new_job(&detail).is_ok());
        assert!(registry
            .new_job(&JobDetail::new("cmd", COMMAND_JOB_TYPE))
            .is_err());
    }

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let job = CommandJob::builder("echo").arg("hello").build();
        let mut ctx = context_for(&job);

        job.execute(&mut ctx).await.unwrap();

        let result = ctx.result().unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(result["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn test_environment_variables_are_passed() {
        let job = CommandJob::builder("sh")
            .args(["-c", "echo $MY_VAR"])
            .env("MY_VAR", "test_value")
            .build();
        let mut ctx = context_for(&job);

        job.execute(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.result().unwrap()["stdout"].as_str().unwrap().trim(),
            "test_value"
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let job = CommandJob::builder("sh").args(["-c", "echo oops >&2; exit 3"]).build();
        let mut ctx = context_for(&job);

        let err = job.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, JobError::CommandFailed(3)));
        assert_eq!(ctx.result().unwrap()["stderr"].as_str().unwrap().trim(), "oops");
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let job = CommandJob::builder("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .build();
        let mut ctx = context_for(&job);

        let err = job.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Failed(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_interrupt_stops_command() {
        let job = CommandJob::builder("sleep").arg("5").build();
        let mut ctx = context_for(&job);
        let token = ctx.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let err = job.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let job = CommandJob::builder("definitely-not-a-real-binary-xyz").build();
        let mut ctx = context_for(&job);
        assert!(matches!(job.execute(&mut ctx).await, Err(JobError::Failed(_))));
    }
}
