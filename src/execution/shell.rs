//! Running one firing.
//!
//! A [`JobRunShell`] owns a fire bundle from the moment the store handed it
//! out until the store has been told the firing finished. It builds the
//! job through the factory, runs it (re-running it when the job asks for
//! that), translates the outcome into a [`CompletedExecutionInstruction`]
//! and reports it, retrying until the store accepts or the scheduler halts.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::context::JobExecutionContext;
use crate::core::job::{Job, JobDetail, JobError, JobFactory};
use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::types::{FireInstanceId, JobKey, TriggerKey};
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, TriggerFiredBundle};

/// A job currently running on this node.
#[derive(Debug, Clone)]
pub struct ExecutingJob {
    pub fire_instance_id: FireInstanceId,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
    cancel: CancellationToken,
}

impl ExecutingJob {
    fn from_context(ctx: &JobExecutionContext) -> Self {
        Self {
            fire_instance_id: ctx.fire_instance_id(),
            job_key: ctx.job_detail().key().clone(),
            trigger_key: ctx.trigger().key().clone(),
            fire_time: ctx.fire_time(),
            scheduled_fire_time: ctx.scheduled_fire_time(),
            recovering: ctx.is_recovering(),
            cancel: ctx.cancellation_token(),
        }
    }
}

/// Registry of executing jobs, used for listing and interruption.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutingJobs {
    inner: Arc<Mutex<HashMap<FireInstanceId, ExecutingJob>>>,
}

impl ExecutingJobs {
    fn insert(&self, job: ExecutingJob) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job.fire_instance_id, job);
        }
    }

    fn remove(&self, id: FireInstanceId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&id);
        }
    }

    /// Snapshot ordered by fire time.
    pub(crate) fn snapshot(&self) -> Vec<ExecutingJob> {
        let mut jobs: Vec<ExecutingJob> = match self.inner.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        jobs.sort_by_key(|j| (j.fire_time, j.fire_instance_id.to_string()));
        jobs
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Cancel every running instance of a job. Returns how many were signalled.
    pub(crate) fn interrupt_job(&self, key: &JobKey) -> usize {
        let Ok(map) = self.inner.lock() else {
            return 0;
        };
        let mut count = 0;
        for job in map.values().filter(|j| &j.job_key == key) {
            job.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Cancel one running firing.
    pub(crate) fn interrupt_instance(&self, id: FireInstanceId) -> bool {
        let Ok(map) = self.inner.lock() else {
            return false;
        };
        match map.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn interrupt_all(&self) {
        if let Ok(map) = self.inner.lock() {
            for job in map.values() {
                job.cancel.cancel();
            }
        }
    }
}

/// What every shell of one scheduler shares.
pub(crate) struct ShellEnvironment {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) factory: Arc<dyn JobFactory>,
    pub(crate) events: EventBus,
    pub(crate) executing: ExecutingJobs,
    /// Cancelled when the scheduler halts; stops completion retries.
    pub(crate) halted: CancellationToken,
    pub(crate) completion_retry_interval: Duration,
}

/// Runs one firing to completion.
pub(crate) struct JobRunShell {
    env: Arc<ShellEnvironment>,
    bundle: TriggerFiredBundle,
}

impl JobRunShell {
    pub(crate) fn new(env: Arc<ShellEnvironment>, bundle: TriggerFiredBundle) -> Self {
        Self { env, bundle }
    }

    pub(crate) async fn run(self) {
        let env = self.env.clone();
        let bundle = self.bundle;
        let job_key = bundle.job_detail.key().clone();

        let job = match env.factory.new_job(&bundle.job_detail) {
            Ok(job) => job,
            Err(e) => {
                error!(job = %job_key, error = %e, "cannot instantiate job; putting its triggers in error");
                env.events.emit(Event::scheduler_error(format!(
                    "cannot instantiate job {}: {}",
                    job_key, e
                )));
                report_completion(
                    &env,
                    &bundle.trigger,
                    bundle.fire_instance_id,
                    &bundle.job_detail,
                    CompletedExecutionInstruction::SetAllJobTriggersError,
                )
                .await;
                return;
            }
        };

        let mut ctx = JobExecutionContext::new(
            bundle.fire_instance_id,
            bundle.trigger,
            bundle.job_detail,
            bundle.fire_time,
            bundle.scheduled_fire_time,
            bundle.recovering,
        );
        env.executing.insert(ExecutingJob::from_context(&ctx));

        let instruction = loop {
            env.events.emit(Event::JobToBeExecuted {
                job_key: job_key.clone(),
                trigger_key: ctx.trigger().key().clone(),
                fire_instance_id: ctx.fire_instance_id(),
                recovering: ctx.is_recovering(),
            });

            let started = Instant::now();
            let (returned, result) = execute_guarded(job.clone(), ctx).await;
            ctx = returned;
            let duration = started.elapsed();

            if let Err(e) = &result {
                warn!(job = %job_key, trigger = %ctx.trigger().key(), error = %e, "job execution failed");
            } else {
                debug!(job = %job_key, duration_ms = duration.as_millis() as u64, "job executed");
            }
            env.events.emit(Event::JobWasExecuted {
                job_key: job_key.clone(),
                trigger_key: ctx.trigger().key().clone(),
                fire_instance_id: ctx.fire_instance_id(),
                duration,
                error: result.as_ref().err().map(|e| e.to_string()),
                refire_count: ctx.refire_count(),
            });

            let instruction = ctx.trigger().execution_complete(&result);
            if instruction == CompletedExecutionInstruction::ReExecuteJob && !ctx.is_cancelled() {
                ctx.increment_refire_count();
                info!(job = %job_key, refire_count = ctx.refire_count(), "job requested re-execution");
                continue;
            }
            break instruction;
        };

        env.executing.remove(ctx.fire_instance_id());
        report_completion(
            &env,
            ctx.trigger(),
            ctx.fire_instance_id(),
            ctx.job_detail(),
            instruction,
        )
        .await;
    }
}

/// Run the job on its own task so a panic becomes a job failure.
async fn execute_guarded(
    job: Arc<dyn Job>,
    ctx: JobExecutionContext,
) -> (JobExecutionContext, Result<(), JobError>) {
    let fallback = ctx.clone();
    let handle = tokio::spawn(async move {
        let mut ctx = ctx;
        let result = job.execute(&mut ctx).await;
        (ctx, result)
    });
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => (fallback, Err(JobError::Panicked(panic_message(e.into_panic())))),
        Err(_) => (fallback, Err(JobError::Interrupted)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn report_completion(
    env: &ShellEnvironment,
    trigger: &Trigger,
    fire_instance_id: FireInstanceId,
    job: &JobDetail,
    instruction: CompletedExecutionInstruction,
) {
    let mut attempts = 0u32;
    loop {
        match env
            .store
            .trigger_completed(trigger, fire_instance_id, job, instruction)
            .await
        {
            Ok(()) => {
                env.events.emit(Event::TriggerCompleted {
                    trigger_key: trigger.key().clone(),
                    job_key: job.key().clone(),
                    fire_instance_id,
                    instruction,
                });
                return;
            }
            Err(e) => {
                attempts += 1;
                error!(
                    trigger = %trigger.key(),
                    error = %e,
                    attempts,
                    "could not report job completion; will retry"
                );
                if attempts == 1 {
                    env.events.emit(Event::scheduler_error(format!(
                        "could not report completion of {}: {}",
                        trigger.key(),
                        e
                    )));
                }
                tokio::select! {
                    _ = env.halted.cancelled() => {
                        warn!(trigger = %trigger.key(), "scheduler halted before job completion was recorded");
                        return;
                    }
                    _ = tokio::time::sleep(env.completion_retry_interval) => {}
                }
            }
        }
    }
}
