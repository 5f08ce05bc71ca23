//! In-memory job store.
//!
//! Single-node backend. One mutex guards all state, which makes every
//! operation trivially atomic. Waiting triggers are kept in a time index
//! ordered by (next fire time, priority descending, key) so acquisition
//! walks them in firing order.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

use super::{
    check_trigger_set, deliver, AcquiredTrigger, FiredState, FiredTriggerRecord, JobStore, Notice,
    StorageError, StoreSettings, TriggerFiredBundle, TriggerFiredResult, TriggerState,
    RECOVERY_GROUP,
};
use crate::core::calendar::SharedCalendar;
use crate::core::clock::{Clock, SharedClock};
use crate::core::job::JobDetail;
use crate::core::misfire::MisfireHandler;
use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::types::{FireInstanceId, InstanceId, JobKey, TriggerKey};
use crate::scheduler::{NoopSignaler, SchedulerSignaler};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimeSlot {
    fire_time: DateTime<Utc>,
    priority: Reverse<i32>,
    key: TriggerKey,
}

#[derive(Debug, Clone)]
struct TriggerRecord {
    trigger: Trigger,
    state: TriggerState,
}

impl TriggerRecord {
    fn slot(&self) -> Option<TimeSlot> {
        if self.state != TriggerState::Waiting {
            return None;
        }
        Some(TimeSlot {
            fire_time: self.trigger.next_fire_time()?,
            priority: Reverse(self.trigger.priority()),
            key: self.trigger.key().clone(),
        })
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    time_index: BTreeSet<TimeSlot>,
    calendars: HashMap<String, SharedCalendar>,
    paused_groups: BTreeSet<String>,
    all_groups_paused: bool,
    blocked_jobs: HashSet<JobKey>,
    fired: HashMap<FireInstanceId, FiredTriggerRecord>,
}

impl State {
    /// Mutate a trigger record while keeping the time index consistent.
    fn with_trigger<R>(
        &mut self,
        key: &TriggerKey,
        f: impl FnOnce(&mut TriggerRecord) -> R,
    ) -> Option<R> {
        let record = self.triggers.get_mut(key)?;
        if let Some(slot) = record.slot() {
            self.time_index.remove(&slot);
        }
        let result = f(record);
        if let Some(slot) = record.slot() {
            self.time_index.insert(slot);
        }
        Some(result)
    }

    /// Whether triggers stored in `group` start out paused.
    fn group_paused(&self, group: &str) -> bool {
        self.all_groups_paused || self.paused_groups.contains(group)
    }

    fn set_state(&mut self, key: &TriggerKey, state: TriggerState) {
        self.with_trigger(key, |r| r.state = state);
    }

    fn trigger_keys_for_job(&self, job_key: &JobKey) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self
            .triggers
            .values()
            .filter(|r| r.trigger.job_key() == job_key)
            .map(|r| r.trigger.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn trigger_keys_in_group(&self, group: &str) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self
            .triggers
            .keys()
            .filter(|k| k.group() == group)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn calendar_for(&self, trigger: &Trigger) -> Option<SharedCalendar> {
        trigger
            .calendar_name()
            .and_then(|name| self.calendars.get(name).cloned())
    }

    fn store_job(&mut self, job: JobDetail, replace: bool) -> Result<(), StorageError> {
        if !replace && self.jobs.contains_key(job.key()) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.key())));
        }
        self.jobs.insert(job.key().clone(), job);
        Ok(())
    }

    fn store_trigger(
        &mut self,
        trigger: Trigger,
        replace: bool,
        notices: &mut Vec<Notice>,
    ) -> Result<(), StorageError> {
        let key = trigger.key().clone();
        if self.triggers.contains_key(&key) {
            if !replace {
                return Err(StorageError::DuplicateKey(format!("trigger: {}", key)));
            }
            self.remove_trigger(&key, false, notices);
        }
        if !self.jobs.contains_key(trigger.job_key()) {
            return Err(StorageError::NotFound(format!(
                "job {} referenced by trigger {}",
                trigger.job_key(),
                key
            )));
        }
        let paused = self.group_paused(key.group());
        let blocked = self.blocked_jobs.contains(trigger.job_key());
        let record = TriggerRecord {
            trigger,
            state: TriggerState::on_store(paused, blocked),
        };
        if let Some(slot) = record.slot() {
            self.time_index.insert(slot);
        }
        self.triggers.insert(key, record);
        Ok(())
    }

    fn remove_trigger(
        &mut self,
        key: &TriggerKey,
        remove_orphaned_job: bool,
        notices: &mut Vec<Notice>,
    ) -> bool {
        let Some(record) = self.triggers.remove(key) else {
            return false;
        };
        if let Some(slot) = record.slot() {
            self.time_index.remove(&slot);
        }
        if remove_orphaned_job {
            let job_key = record.trigger.job_key();
            let orphaned = self
                .jobs
                .get(job_key)
                .is_some_and(|j| !j.is_durable())
                && self.trigger_keys_for_job(job_key).is_empty();
            if orphaned {
                self.jobs.remove(job_key);
                notices.push(Notice::JobDeleted(job_key.clone()));
            }
        }
        true
    }

    fn pause_trigger(&mut self, key: &TriggerKey) {
        self.with_trigger(key, |r| {
            r.state = match r.state {
                TriggerState::Waiting | TriggerState::Acquired => TriggerState::Paused,
                TriggerState::Blocked => TriggerState::PausedBlocked,
                other => other,
            };
        });
    }

    fn resume_trigger(
        &mut self,
        key: &TriggerKey,
        misfire: &MisfireHandler,
        now: DateTime<Utc>,
        notices: &mut Vec<Notice>,
    ) {
        let Some(record) = self.triggers.get(key) else {
            return;
        };
        if !record.state.is_paused() {
            return;
        }
        let blocked = self.blocked_jobs.contains(record.trigger.job_key());
        let calendar = self.calendar_for(&record.trigger);
        self.with_trigger(key, |r| {
            r.state = TriggerState::on_store(false, blocked);
            if misfire
                .apply(&mut r.trigger, calendar.as_deref(), now)
                .is_some()
            {
                notices.push(Notice::Misfired(r.trigger.clone()));
                match r.trigger.next_fire_time() {
                    Some(t) => notices.push(Notice::Signal(Some(t))),
                    None => {
                        r.state = TriggerState::Complete;
                        notices.push(Notice::Finalized(r.trigger.clone()));
                    }
                }
            } else if let Some(t) = r.trigger.next_fire_time() {
                notices.push(Notice::Signal(Some(t)));
            }
        });
    }

    fn all_trigger_groups(&self) -> BTreeSet<String> {
        self.triggers
            .keys()
            .map(|k| k.group().to_string())
            .collect()
    }
}

/// In-memory job store.
///
/// Data is not persisted across restarts.
pub struct InMemoryJobStore {
    state: Mutex<State>,
    settings: StoreSettings,
    signaler: RwLock<Arc<dyn SchedulerSignaler>>,
}

impl InMemoryJobStore {
    /// Create an empty store with default settings.
    pub fn new() -> Self {
        Self::with_settings(StoreSettings::default())
    }

    /// Create an empty store with the given settings.
    pub fn with_settings(settings: StoreSettings) -> Self {
        Self {
            state: Mutex::new(State::default()),
            settings,
            signaler: RwLock::new(Arc::new(NoopSignaler)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn now(&self) -> DateTime<Utc> {
        self.settings.clock.now()
    }

    fn deliver(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let signaler = match self.signaler.read() {
            Ok(s) => s.clone(),
            Err(_) => return,
        };
        deliver(signaler.as_ref(), notices);
    }

    /// Fired-trigger records currently held, for inspection.
    pub fn fired_records(&self) -> Result<Vec<FiredTriggerRecord>, StorageError> {
        let state = self.lock()?;
        Ok(state.fired.values().cloned().collect())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StorageError> {
        let mut slot = self.signaler.write().map_err(|_| StorageError::LockPoisoned)?;
        *slot = signaler;
        Ok(())
    }

    async fn scheduler_started(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn supports_persistence(&self) -> bool {
        false
    }

    fn instance_id(&self) -> InstanceId {
        self.settings.instance_id.clone()
    }

    fn clock(&self) -> SharedClock {
        self.settings.clock.clone()
    }

    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            if state.jobs.contains_key(job.key()) {
                return Err(StorageError::DuplicateKey(format!("job: {}", job.key())));
            }
            if state.triggers.contains_key(trigger.key()) {
                return Err(StorageError::DuplicateKey(format!("trigger: {}", trigger.key())));
            }
            state.store_job(job, false)?;
            state.store_trigger(trigger, false, &mut notices)?;
        }
        self.deliver(notices);
        Ok(())
    }

    async fn store_job_and_triggers(
        &self,
        job: JobDetail,
        triggers: Vec<Trigger>,
        replace: bool,
    ) -> Result<(), StorageError> {
        check_trigger_set(&job, &triggers)?;
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            if !replace {
                if state.jobs.contains_key(job.key()) {
                    return Err(StorageError::DuplicateKey(format!("job: {}", job.key())));
                }
                if let Some(taken) = triggers.iter().find(|t| state.triggers.contains_key(t.key())) {
                    return Err(StorageError::DuplicateKey(format!("trigger: {}", taken.key())));
                }
            }
            // Nothing below can fail once the checks above have passed.
            state.store_job(job, replace)?;
            for trigger in triggers {
                state.store_trigger(trigger, replace, &mut notices)?;
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StorageError> {
        self.lock()?.store_job(job, replace)
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        let result = self.lock()?.store_trigger(trigger, replace, &mut notices);
        self.deliver(notices);
        result
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StorageError> {
        let mut notices = Vec::new();
        let existed = {
            let mut state = self.lock()?;
            for trigger_key in state.trigger_keys_for_job(key) {
                state.remove_trigger(&trigger_key, false, &mut notices);
            }
            state.jobs.remove(key).is_some()
        };
        self.deliver(notices);
        Ok(existed)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StorageError> {
        let mut notices = Vec::new();
        let removed = self.lock()?.remove_trigger(key, true, &mut notices);
        self.deliver(notices);
        Ok(removed)
    }

    async fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<bool, StorageError> {
        let mut notices = Vec::new();
        let replaced = {
            let mut state = self.lock()?;
            let Some(old) = state.triggers.get(key) else {
                return Ok(false);
            };
            if old.trigger.job_key() != trigger.job_key() {
                return Err(StorageError::Invalid(format!(
                    "new trigger is for job {}, old trigger {} is for job {}",
                    trigger.job_key(),
                    key,
                    old.trigger.job_key()
                )));
            }
            state.remove_trigger(key, false, &mut notices);
            state.store_trigger(trigger, false, &mut notices)?;
            true
        };
        self.deliver(notices);
        Ok(replaced)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StorageError> {
        Ok(self.lock()?.jobs.get(key).cloned())
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StorageError> {
        Ok(self.lock()?.triggers.get(key).map(|r| r.trigger.clone()))
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .trigger_keys_for_job(key)
            .iter()
            .filter_map(|k| state.triggers.get(k).map(|r| r.trigger.clone()))
            .collect())
    }

    async fn job_keys(&self) -> Result<Vec<JobKey>, StorageError> {
        let mut keys: Vec<JobKey> = self.lock()?.jobs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StorageError> {
        let mut keys: Vec<TriggerKey> = self.lock()?.triggers.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        *self.lock()? = State::default();
        Ok(())
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: SharedCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), StorageError> {
        let now = self.now();
        let threshold = self.settings.misfire_threshold;
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            if !replace && state.calendars.contains_key(name) {
                return Err(StorageError::DuplicateKey(format!("calendar: {}", name)));
            }
            state.calendars.insert(name.to_string(), calendar.clone());
            if update_triggers {
                let keys: Vec<TriggerKey> = state
                    .triggers
                    .values()
                    .filter(|r| r.trigger.calendar_name() == Some(name))
                    .map(|r| r.trigger.key().clone())
                    .collect();
                for key in keys {
                    state.with_trigger(&key, |r| {
                        r.trigger
                            .update_with_new_calendar(Some(calendar.as_ref()), now, threshold);
                        if let Some(t) = r.trigger.next_fire_time() {
                            notices.push(Notice::Signal(Some(t)));
                        }
                    });
                }
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        if state
            .triggers
            .values()
            .any(|r| r.trigger.calendar_name() == Some(name))
        {
            return Err(StorageError::InUse(format!(
                "calendar {} is referenced by a trigger",
                name
            )));
        }
        Ok(state.calendars.remove(name).is_some())
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<SharedCalendar>, StorageError> {
        Ok(self.lock()?.calendars.get(name).cloned())
    }

    async fn calendar_names(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.lock()?.calendars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, StorageError> {
        Ok(self.lock()?.triggers.get(key).map(|r| r.state))
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StorageError> {
        self.lock()?.pause_trigger(key);
        Ok(())
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StorageError> {
        let misfire = self.settings.misfire_handler();
        let now = self.now();
        let mut notices = Vec::new();
        self.lock()?.resume_trigger(key, &misfire, now, &mut notices);
        self.deliver(notices);
        Ok(())
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        for trigger_key in state.trigger_keys_for_job(key) {
            state.pause_trigger(&trigger_key);
        }
        Ok(())
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), StorageError> {
        let misfire = self.settings.misfire_handler();
        let now = self.now();
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            for trigger_key in state.trigger_keys_for_job(key) {
                state.resume_trigger(&trigger_key, &misfire, now, &mut notices);
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn pause_trigger_group(&self, group: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.paused_groups.insert(group.to_string());
        for key in state.trigger_keys_in_group(group) {
            state.pause_trigger(&key);
        }
        Ok(())
    }

    async fn resume_trigger_group(&self, group: &str) -> Result<(), StorageError> {
        let misfire = self.settings.misfire_handler();
        let now = self.now();
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            state.paused_groups.remove(group);
            for key in state.trigger_keys_in_group(group) {
                state.resume_trigger(&key, &misfire, now, &mut notices);
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn pause_all(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.all_groups_paused = true;
        for group in state.all_trigger_groups() {
            state.paused_groups.insert(group.clone());
            for key in state.trigger_keys_in_group(&group) {
                state.pause_trigger(&key);
            }
        }
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), StorageError> {
        let misfire = self.settings.misfire_handler();
        let now = self.now();
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            state.all_groups_paused = false;
            let mut groups = state.all_trigger_groups();
            groups.extend(std::mem::take(&mut state.paused_groups));
            for group in groups {
                for key in state.trigger_keys_in_group(&group) {
                    state.resume_trigger(&key, &misfire, now, &mut notices);
                }
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn paused_trigger_groups(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock()?.paused_groups.iter().cloned().collect())
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock()?;
            let Some(record) = state.triggers.get(key) else {
                return Ok(());
            };
            if record.state != TriggerState::Error {
                return Ok(());
            }
            let paused = state.group_paused(key.group());
            let blocked = state.blocked_jobs.contains(record.trigger.job_key());
            state.set_state(key, TriggerState::on_store(paused, blocked));
            if let Some(t) = state.triggers.get(key).and_then(|r| r.trigger.next_fire_time()) {
                notices.push(Notice::Signal(Some(t)));
            }
        }
        self.deliver(notices);
        Ok(())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>, StorageError> {
        let now = self.now();
        let misfire = self.settings.misfire_handler();
        let mut notices = Vec::new();
        let mut acquired = Vec::new();
        {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let mut batch_end = no_later_than;
            let mut acquired_jobs: HashSet<JobKey> = HashSet::new();
            let mut deferred: Vec<TimeSlot> = Vec::new();
            let mut misfires_handled = 0;

            while acquired.len() < max_count {
                let Some(slot) = state.time_index.pop_first() else {
                    break;
                };
                let Some(record) = state.triggers.get_mut(&slot.key) else {
                    continue;
                };

                if misfire.is_misfired(&record.trigger, now) {
                    if misfires_handled >= self.settings.max_misfires_per_acquisition {
                        // Left for the next pass; a misfired trigger is never acquired as is.
                        deferred.push(slot);
                        continue;
                    }
                    misfires_handled += 1;
                    let calendar = record
                        .trigger
                        .calendar_name()
                        .and_then(|name| state.calendars.get(name).cloned());
                    misfire.apply(&mut record.trigger, calendar.as_deref(), now);
                    notices.push(Notice::Misfired(record.trigger.clone()));
                    match record.slot() {
                        Some(new_slot) => {
                            notices.push(Notice::Signal(Some(new_slot.fire_time)));
                            state.time_index.insert(new_slot);
                        }
                        None => {
                            record.state = TriggerState::Complete;
                            notices.push(Notice::Finalized(record.trigger.clone()));
                        }
                    }
                    continue;
                }

                if slot.fire_time > batch_end {
                    state.time_index.insert(slot);
                    break;
                }

                let job_key = record.trigger.job_key().clone();
                let Some(job) = state.jobs.get(&job_key) else {
                    deferred.push(slot);
                    continue;
                };
                if job.is_concurrent_execution_disallowed() {
                    if acquired_jobs.contains(&job_key) {
                        deferred.push(slot);
                        continue;
                    }
                    acquired_jobs.insert(job_key.clone());
                }

                record.state = TriggerState::Acquired;
                let fire_instance_id = FireInstanceId::new();
                state.fired.insert(
                    fire_instance_id,
                    FiredTriggerRecord {
                        fire_instance_id,
                        trigger_key: slot.key.clone(),
                        job_key,
                        instance_id: self.settings.instance_id.clone(),
                        fired_time: now,
                        scheduled_time: slot.fire_time,
                        priority: record.trigger.priority(),
                        state: FiredState::Acquired,
                        concurrent_execution_disallowed: job.is_concurrent_execution_disallowed(),
                        requests_recovery: job.requests_recovery(),
                    },
                );
                if acquired.is_empty() {
                    batch_end = slot.fire_time.max(now) + time_window;
                }
                acquired.push(AcquiredTrigger {
                    fire_instance_id,
                    trigger: record.trigger.clone(),
                });
            }

            state.time_index.extend(deferred);
            if misfires_handled > 0 {
                debug!(count = misfires_handled, "handled misfired triggers");
            }
        }
        self.deliver(notices);
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.fired.remove(&acquired.fire_instance_id);
        state.with_trigger(acquired.key(), |r| {
            if r.state == TriggerState::Acquired {
                r.state = TriggerState::Waiting;
            }
        });
        Ok(())
    }

    async fn trigger_fired(&self, acquired: &AcquiredTrigger) -> Result<TriggerFiredResult, StorageError> {
        let now = self.now();
        let mut notices = Vec::new();
        let result = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let key = acquired.key();

            let Some(record) = state.triggers.get(key) else {
                state.fired.remove(&acquired.fire_instance_id);
                return Ok(TriggerFiredResult::Gone);
            };
            if record.state != TriggerState::Acquired {
                state.fired.remove(&acquired.fire_instance_id);
                return Ok(TriggerFiredResult::Gone);
            }

            let calendar = match record.trigger.calendar_name() {
                Some(name) => match state.calendars.get(name) {
                    Some(cal) => Some(cal.clone()),
                    None => {
                        let message = format!("trigger {} references unknown calendar {}", key, name);
                        state.fired.remove(&acquired.fire_instance_id);
                        state.set_state(key, TriggerState::Error);
                        notices.push(Notice::Error(message));
                        drop(guard);
                        self.deliver(notices);
                        return Ok(TriggerFiredResult::Gone);
                    }
                },
                None => None,
            };

            let job_key = record.trigger.job_key().clone();
            let Some(job) = state.jobs.get(&job_key).cloned() else {
                state.fired.remove(&acquired.fire_instance_id);
                return Ok(TriggerFiredResult::Gone);
            };
            let nonconcurrent = job.is_concurrent_execution_disallowed();

            if nonconcurrent && state.blocked_jobs.contains(&job_key) {
                state.fired.remove(&acquired.fire_instance_id);
                state.set_state(key, TriggerState::Blocked);
                TriggerFiredResult::Blocked
            } else {
                let scheduled = record.trigger.next_fire_time();
                let fired_trigger = state
                    .with_trigger(key, |r| {
                        r.trigger.triggered(calendar.as_deref());
                        r.state = if r.trigger.next_fire_time().is_some() {
                            TriggerState::Waiting
                        } else {
                            TriggerState::Executing
                        };
                        r.trigger.clone()
                    })
                    .ok_or_else(|| StorageError::NotFound(format!("trigger: {}", key)))?;

                if let Some(fired) = state.fired.get_mut(&acquired.fire_instance_id) {
                    fired.state = FiredState::Executing;
                    fired.fired_time = now;
                }

                if nonconcurrent {
                    state.blocked_jobs.insert(job_key.clone());
                    for sibling in state.trigger_keys_for_job(&job_key) {
                        state.with_trigger(&sibling, |r| {
                            r.state = match r.state {
                                TriggerState::Waiting | TriggerState::Acquired => TriggerState::Blocked,
                                TriggerState::Paused => TriggerState::PausedBlocked,
                                other => other,
                            };
                        });
                    }
                }

                TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                    fire_instance_id: acquired.fire_instance_id,
                    recovering: key.group() == RECOVERY_GROUP,
                    trigger: fired_trigger,
                    job_detail: job,
                    fire_time: now,
                    scheduled_fire_time: scheduled,
                }))
            }
        };
        self.deliver(notices);
        Ok(result)
    }

    async fn trigger_completed(
        &self,
        trigger: &Trigger,
        fire_instance_id: FireInstanceId,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            state.fired.remove(&fire_instance_id);

            let mut nonconcurrent = job.is_concurrent_execution_disallowed();
            if let Some(stored) = state.jobs.get_mut(job.key()) {
                nonconcurrent = stored.is_concurrent_execution_disallowed();
                if stored.is_persist_data_after_execution() {
                    *stored.data_mut() = job.data().clone();
                }
            }

            if nonconcurrent {
                state.blocked_jobs.remove(job.key());
                for sibling in state.trigger_keys_for_job(job.key()) {
                    state.with_trigger(&sibling, |r| {
                        r.state = match r.state {
                            TriggerState::Blocked => TriggerState::Waiting,
                            TriggerState::PausedBlocked => TriggerState::Paused,
                            other => other,
                        };
                    });
                }
                notices.push(Notice::Signal(None));
            }

            let key = trigger.key();
            match instruction {
                CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {
                    if let Some(finished) = state.with_trigger(key, |r| {
                        let done = r.state == TriggerState::Executing;
                        if done {
                            r.state = TriggerState::Complete;
                        }
                        done.then(|| r.trigger.clone())
                    })
                    .flatten()
                    {
                        notices.push(Notice::Finalized(finished));
                    }
                }
                CompletedExecutionInstruction::SetTriggerComplete => {
                    if let Some(finished) = state.with_trigger(key, |r| {
                        r.state = TriggerState::Complete;
                        r.trigger.clone()
                    }) {
                        notices.push(Notice::Finalized(finished));
                    }
                    notices.push(Notice::Signal(None));
                }
                CompletedExecutionInstruction::DeleteTrigger => {
                    state.remove_trigger(key, true, &mut notices);
                    notices.push(Notice::Signal(None));
                }
                CompletedExecutionInstruction::SetTriggerError => {
                    state.set_state(key, TriggerState::Error);
                    notices.push(Notice::Signal(None));
                }
                CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                    for sibling in state.trigger_keys_for_job(job.key()) {
                        state.set_state(&sibling, TriggerState::Complete);
                    }
                    notices.push(Notice::Signal(None));
                }
                CompletedExecutionInstruction::SetAllJobTriggersError => {
                    for sibling in state.trigger_keys_for_job(job.key()) {
                        state.set_state(&sibling, TriggerState::Error);
                    }
                    notices.push(Notice::Signal(None));
                }
            }
        }
        self.deliver(notices);
        Ok(())
    }
}
