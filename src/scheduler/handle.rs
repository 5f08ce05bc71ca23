//! Scheduler handle: the public scheduling API.
//!
//! Lifecycle requests (start, standby, shutdown) go to the fire loop over
//! the command channel. Job and trigger management goes straight to the
//! job store, whose operations are atomic, followed by a wake-up signal
//! for the fire loop and the matching listener events.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::calendar::SharedCalendar;
use crate::core::job::{JobDataMap, JobDetail};
use crate::core::trigger::{Trigger, TriggerError};
use crate::core::types::{FireInstanceId, InstanceId, JobKey, TriggerKey};
use crate::events::{Event, EventBus};
use crate::execution::ExecutingJob;
use crate::storage::{JobStore, TriggerState};

use super::engine::SchedulerCore;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Group of the one-shot triggers created by [`SchedulerHandle::trigger_job`].
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    core: Arc<SchedulerCore>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.core.name)
            .field("instance_id", &self.core.store.instance_id())
            .finish()
    }
}

impl SchedulerHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SchedulerCommand>, core: Arc<SchedulerCore>) -> Self {
        Self { command_tx, core }
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;

        Ok(())
    }

    async fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.state().await.is_shutdown() {
            Err(SchedulerError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn store(&self) -> &dyn JobStore {
        self.core.store.as_ref()
    }

    async fn require_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        if self.store().check_trigger_exists(key).await? {
            Ok(())
        } else {
            Err(SchedulerError::TriggerNotFound(key.to_string()))
        }
    }

    // Lifecycle

    /// Start firing triggers, or resume after [`standby`](Self::standby).
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.send_unit_command(|response| SchedulerCommand::Start { response }, "start")
            .await
    }

    /// Stop firing triggers. Running jobs continue; scheduling still works.
    pub async fn standby(&self) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.send_unit_command(|response| SchedulerCommand::Standby { response }, "standby")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// With `wait_for_jobs`, returns once running jobs finished or the
    /// shutdown timeout elapsed. Calling it again is harmless.
    pub async fn shutdown(&self, wait_for_jobs: bool) -> Result<(), SchedulerError> {
        if self.state().await == SchedulerState::Shutdown {
            return Ok(());
        }
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown {
                wait_for_jobs,
                response,
            },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.core.state.read().await
    }

    pub async fn is_started(&self) -> bool {
        self.state().await == SchedulerState::Started
    }

    pub async fn is_in_standby(&self) -> bool {
        self.state().await == SchedulerState::Standby
    }

    pub async fn is_shutdown(&self) -> bool {
        self.state().await == SchedulerState::Shutdown
    }

    pub fn scheduler_name(&self) -> &str {
        &self.core.name
    }

    pub fn instance_id(&self) -> InstanceId {
        self.core.store.instance_id()
    }

    /// The listener bus. Register handlers here.
    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    // Scheduling

    /// Validate a trigger and compute its first fire time against its calendar.
    async fn prepare_trigger(&self, trigger: &mut Trigger) -> Result<DateTime<Utc>, SchedulerError> {
        trigger.validate()?;
        let calendar = match trigger.calendar_name() {
            Some(name) => Some(self.store().retrieve_calendar(name).await?.ok_or_else(|| {
                SchedulerError::Invalid(format!(
                    "calendar '{}' referenced by trigger {} does not exist",
                    name,
                    trigger.key()
                ))
            })?),
            None => None,
        };
        trigger
            .compute_first_fire_time(calendar.as_deref())
            .ok_or_else(|| TriggerError::WillNeverFire(trigger.key().clone()).into())
    }

    fn check_job_type(&self, job: &JobDetail) -> Result<(), SchedulerError> {
        if self.core.factory.supports(job.job_type()) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownJobType(job.job_type().to_string()))
        }
    }

    /// Store a job and a trigger for it. Returns the first fire time.
    pub async fn schedule_job(
        &self,
        job: JobDetail,
        mut trigger: Trigger,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.ensure_running().await?;
        self.check_job_type(&job)?;
        if trigger.job_key() != job.key() {
            return Err(SchedulerError::Invalid(format!(
                "trigger {} is for job {}, not {}",
                trigger.key(),
                trigger.job_key(),
                job.key()
            )));
        }
        let first = self.prepare_trigger(&mut trigger).await?;
        let job_key = job.key().clone();
        let trigger_key = trigger.key().clone();

        self.store().store_job_and_trigger(job, trigger).await?;
        self.core.signal_change(Some(first));

        info!(job = %job_key, trigger = %trigger_key, first_fire_time = %first, "job scheduled");
        self.core.events.emit(Event::JobAdded {
            job_key: job_key.clone(),
        });
        self.core.events.emit(Event::JobScheduled {
            trigger_key,
            job_key,
            next_fire_time: Some(first),
        });
        Ok(first)
    }

    /// Store a job together with any number of triggers.
    ///
    /// With `replace`, an existing job and triggers with the same keys are
    /// overwritten; otherwise a key collision fails with a duplicate-key error.
    pub async fn schedule_job_with_triggers(
        &self,
        job: JobDetail,
        mut triggers: Vec<Trigger>,
        replace: bool,
    ) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.check_job_type(&job)?;
        if triggers.is_empty() && !job.is_durable() {
            return Err(SchedulerError::Invalid(format!(
                "job {} has no trigger and is not durable",
                job.key()
            )));
        }
        let mut first_times = Vec::with_capacity(triggers.len());
        for trigger in &mut triggers {
            if trigger.job_key() != job.key() {
                return Err(SchedulerError::Invalid(format!(
                    "trigger {} is for job {}, not {}",
                    trigger.key(),
                    trigger.job_key(),
                    job.key()
                )));
            }
            first_times.push(self.prepare_trigger(trigger).await?);
        }

        let job_key = job.key().clone();
        let scheduled: Vec<(TriggerKey, DateTime<Utc>)> = triggers
            .iter()
            .map(|t| t.key().clone())
            .zip(first_times)
            .collect();
        self.store()
            .store_job_and_triggers(job, triggers, replace)
            .await?;
        self.core.events.emit(Event::JobAdded {
            job_key: job_key.clone(),
        });
        for (trigger_key, first) in scheduled {
            info!(job = %job_key, trigger = %trigger_key, first_fire_time = %first, "job scheduled");
            self.core.events.emit(Event::JobScheduled {
                trigger_key,
                job_key: job_key.clone(),
                next_fire_time: Some(first),
            });
        }
        self.core.signal_change(None);
        Ok(())
    }

    /// Store a trigger for an existing job. Returns the first fire time.
    pub async fn schedule_trigger(&self, mut trigger: Trigger) -> Result<DateTime<Utc>, SchedulerError> {
        self.ensure_running().await?;
        if !self.store().check_job_exists(trigger.job_key()).await? {
            return Err(SchedulerError::JobNotFound(trigger.job_key().to_string()));
        }
        let first = self.prepare_trigger(&mut trigger).await?;
        let job_key = trigger.job_key().clone();
        let trigger_key = trigger.key().clone();

        self.store().store_trigger(trigger, false).await?;
        self.core.signal_change(Some(first));

        debug!(job = %job_key, trigger = %trigger_key, first_fire_time = %first, "trigger scheduled");
        self.core.events.emit(Event::JobScheduled {
            trigger_key,
            job_key,
            next_fire_time: Some(first),
        });
        Ok(first)
    }

    /// Store a job without a trigger. Such a job must be durable.
    pub async fn add_job(&self, job: JobDetail, replace: bool) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.check_job_type(&job)?;
        if !job.is_durable() {
            return Err(SchedulerError::Invalid(format!(
                "job {} has no trigger and is not durable",
                job.key()
            )));
        }
        let job_key = job.key().clone();
        self.store().store_job(job, replace).await?;
        self.core.events.emit(Event::JobAdded { job_key });
        Ok(())
    }

    /// Remove a job and all its triggers.
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.ensure_running().await?;
        let triggers = self.store().get_triggers_for_job(key).await?;
        let removed = self.store().remove_job(key).await?;
        if removed {
            for trigger in triggers {
                self.core.events.emit(Event::JobUnscheduled {
                    trigger_key: trigger.key().clone(),
                });
            }
            self.core.events.emit(Event::JobDeleted { job_key: key.clone() });
            self.core.signal_change(None);
        }
        Ok(removed)
    }

    /// Remove a trigger. A non-durable job left without triggers is removed too.
    pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        self.ensure_running().await?;
        let removed = self.store().remove_trigger(key).await?;
        if removed {
            self.core.events.emit(Event::JobUnscheduled {
                trigger_key: key.clone(),
            });
            self.core.signal_change(None);
        }
        Ok(removed)
    }

    /// Replace the trigger stored under `key` with `trigger`, for the same job.
    ///
    /// Returns the new first fire time, or `None` when no trigger was stored under `key`.
    pub async fn reschedule_job(
        &self,
        key: &TriggerKey,
        mut trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.ensure_running().await?;
        let Some(old) = self.store().retrieve_trigger(key).await? else {
            return Ok(None);
        };
        trigger.set_job_key(old.job_key().clone());
        let first = self.prepare_trigger(&mut trigger).await?;
        let new_key = trigger.key().clone();
        let job_key = trigger.job_key().clone();

        if !self.store().replace_trigger(key, trigger).await? {
            return Ok(None);
        }
        self.core.signal_change(Some(first));
        self.core.events.emit(Event::JobUnscheduled {
            trigger_key: key.clone(),
        });
        self.core.events.emit(Event::JobScheduled {
            trigger_key: new_key,
            job_key,
            next_fire_time: Some(first),
        });
        Ok(Some(first))
    }

    /// Fire a stored job now, through a one-shot trigger in [`MANUAL_TRIGGER_GROUP`].
    pub async fn trigger_job(&self, key: &JobKey, data: JobDataMap) -> Result<TriggerKey, SchedulerError> {
        self.ensure_running().await?;
        if !self.store().check_job_exists(key).await? {
            return Err(SchedulerError::JobNotFound(key.to_string()));
        }
        let trigger_key = TriggerKey::new(format!("MT_{}", Uuid::new_v4().simple()), MANUAL_TRIGGER_GROUP);
        let mut trigger = Trigger::builder(trigger_key.clone(), key.clone())
            .starting_at(self.core.now())
            .with_data_map(data)
            .build()?;
        let first = self.prepare_trigger(&mut trigger).await?;

        self.store().store_trigger(trigger, false).await?;
        self.core.signal_change(Some(first));
        info!(job = %key, trigger = %trigger_key, "job triggered manually");
        self.core.events.emit(Event::JobScheduled {
            trigger_key: trigger_key.clone(),
            job_key: key.clone(),
            next_fire_time: Some(first),
        });
        Ok(trigger_key)
    }

    // Pause and resume

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.require_trigger(key).await?;
        self.store().pause_trigger(key).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::TriggerPaused {
            trigger_key: key.clone(),
        });
        Ok(())
    }

    /// Resume a trigger. A fire time missed while paused goes through misfire handling.
    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.require_trigger(key).await?;
        self.store().resume_trigger(key).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::TriggerResumed {
            trigger_key: key.clone(),
        });
        Ok(())
    }

    /// Pause every trigger of a job.
    pub async fn pause_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store().pause_job(key).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::JobPaused { job_key: key.clone() });
        Ok(())
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store().resume_job(key).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::JobResumed { job_key: key.clone() });
        Ok(())
    }

    /// Pause a trigger group. Triggers stored in it later start paused.
    pub async fn pause_trigger_group(&self, group: &str) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store().pause_trigger_group(group).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::TriggerGroupPaused {
            group: group.to_string(),
        });
        Ok(())
    }

    pub async fn resume_trigger_group(&self, group: &str) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store().resume_trigger_group(group).await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::TriggerGroupResumed {
            group: group.to_string(),
        });
        Ok(())
    }

    /// Pause every trigger group.
    pub async fn pause_all(&self) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        let before = self.store().paused_trigger_groups().await?;
        self.store().pause_all().await?;
        self.core.signal_change(None);
        for group in self.store().paused_trigger_groups().await? {
            if !before.contains(&group) {
                self.core.events.emit(Event::TriggerGroupPaused { group });
            }
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        let groups = self.store().paused_trigger_groups().await?;
        self.store().resume_all().await?;
        self.core.signal_change(None);
        for group in groups {
            self.core.events.emit(Event::TriggerGroupResumed { group });
        }
        Ok(())
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store().paused_trigger_groups().await?)
    }

    pub async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, SchedulerError> {
        Ok(self.store().get_trigger_state(key).await?)
    }

    /// Return a trigger in ERROR to WAITING (or PAUSED, if its group is paused).
    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.require_trigger(key).await?;
        self.store().reset_trigger_from_error_state(key).await?;
        self.core.signal_change(None);
        Ok(())
    }

    // Lookup

    pub async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>, SchedulerError> {
        Ok(self.store().retrieve_job(key).await?)
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, SchedulerError> {
        Ok(self.store().retrieve_trigger(key).await?)
    }

    pub async fn get_triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>, SchedulerError> {
        Ok(self.store().get_triggers_for_job(key).await?)
    }

    pub async fn job_keys(&self) -> Result<Vec<JobKey>, SchedulerError> {
        Ok(self.store().job_keys().await?)
    }

    pub async fn trigger_keys(&self) -> Result<Vec<TriggerKey>, SchedulerError> {
        Ok(self.store().trigger_keys().await?)
    }

    pub async fn check_job_exists(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        Ok(self.store().check_job_exists(key).await?)
    }

    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        Ok(self.store().check_trigger_exists(key).await?)
    }

    /// Remove every job, trigger and calendar.
    pub async fn clear(&self) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store().clear_all().await?;
        self.core.signal_change(None);
        self.core.events.emit(Event::SchedulingDataCleared);
        Ok(())
    }

    // Calendars

    /// Store a calendar. With `update_triggers`, referencing triggers get
    /// their fire times recomputed against it.
    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: SharedCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), SchedulerError> {
        self.ensure_running().await?;
        self.store()
            .store_calendar(name, calendar, replace, update_triggers)
            .await?;
        self.core.signal_change(None);
        Ok(())
    }

    /// Remove a calendar. Fails while a trigger references it.
    pub async fn delete_calendar(&self, name: &str) -> Result<bool, SchedulerError> {
        self.ensure_running().await?;
        Ok(self.store().remove_calendar(name).await?)
    }

    pub async fn get_calendar(&self, name: &str) -> Result<Option<SharedCalendar>, SchedulerError> {
        Ok(self.store().retrieve_calendar(name).await?)
    }

    pub async fn calendar_names(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store().calendar_names().await?)
    }

    // Running jobs

    /// Jobs executing on this node, oldest firing first.
    pub fn currently_executing_jobs(&self) -> Vec<ExecutingJob> {
        self.core.executing.snapshot()
    }

    /// Ask every running instance of a job to stop. Returns how many were asked.
    pub fn interrupt(&self, key: &JobKey) -> usize {
        let count = self.core.executing.interrupt_job(key);
        if count > 0 {
            info!(job = %key, count, "interrupt requested");
        }
        count
    }

    /// Ask one firing to stop.
    pub fn interrupt_instance(&self, id: FireInstanceId) -> bool {
        self.core.executing.interrupt_instance(id)
    }
}
