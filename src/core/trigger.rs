//! Triggers: schedule rules bound to a job.
//!
//! A [`Trigger`] pairs a [`Schedule`] with the bookkeeping the engine needs
//! to fire it: priority, start/end bounds, an optional exclusion calendar,
//! a misfire instruction, and the mutable scheduling state (next and
//! previous fire times, times triggered).
//!
//! Triggers reference their job by [`JobKey`] only; the store resolves it.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::calendar::Calendar;
use super::clock::truncate_millis;
use super::job::{JobDataMap, JobError};
use super::misfire::{MisfireInstruction, SmartMisfirePolicy};
use super::schedule::{Repeat, Schedule, ScheduleError, ScheduleKind};
use super::types::{JobKey, TriggerKey};

/// Default trigger priority.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Calendar skipping gives up once a candidate passes this year.
const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

/// Errors raised when a trigger definition is invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// The schedule parameters are invalid.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The misfire instruction does not apply to this schedule variant.
    #[error("misfire instruction {instruction:?} is not valid for {kind} triggers")]
    InvalidMisfireInstruction {
        instruction: MisfireInstruction,
        kind: ScheduleKind,
    },

    /// End time precedes start time.
    #[error("end time precedes start time")]
    EndBeforeStart,

    /// The trigger would never produce a fire time.
    #[error("trigger {0} will never fire")]
    WillNeverFire(TriggerKey),
}

/// What the store should do with a trigger after its job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Normal path: keep the trigger's computed next fire time.
    Noop,
    /// Run the job again immediately with the same context.
    ReExecuteJob,
    /// Mark this trigger complete.
    SetTriggerComplete,
    /// Remove this trigger.
    DeleteTrigger,
    /// Mark every trigger of the job complete.
    SetAllJobTriggersComplete,
    /// Put this trigger in the error state.
    SetTriggerError,
    /// Put every trigger of the job in the error state.
    SetAllJobTriggersError,
}

/// A schedule rule for one job, plus its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    key: TriggerKey,
    job_key: JobKey,
    description: Option<String>,
    priority: i32,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    calendar_name: Option<String>,
    misfire_instruction: MisfireInstruction,
    data: JobDataMap,
    schedule: Schedule,
    next_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    times_triggered: u32,
}

impl Trigger {
    /// Start building a trigger for a job.
    pub fn builder(key: impl Into<TriggerKey>, job_key: impl Into<JobKey>) -> TriggerBuilder {
        TriggerBuilder::new(key.into(), job_key.into())
    }

    pub fn key(&self) -> &TriggerKey {
        &self.key
    }

    pub fn job_key(&self) -> &JobKey {
        &self.job_key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Higher priority fires first among triggers due at the same instant.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Name of the exclusion calendar, if any.
    pub fn calendar_name(&self) -> Option<&str> {
        self.calendar_name.as_deref()
    }

    pub fn misfire_instruction(&self) -> MisfireInstruction {
        self.misfire_instruction
    }

    /// Trigger-level job data, layered over the job's own data at fire time.
    pub fn data(&self) -> &JobDataMap {
        &self.data
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    pub fn times_triggered(&self) -> u32 {
        self.times_triggered
    }

    /// Whether there is any future firing left.
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// Final fire time, when it can be computed without enumerating the schedule.
    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::Simple(s) => match s.repeat {
                Repeat::Count(0) => Some(self.start_time),
                Repeat::Count(n) => {
                    let last = self.start_time + Duration::milliseconds(s.interval_ms * i64::from(n));
                    match self.end_time {
                        Some(end) if end < last => {
                            let fits = (end - self.start_time).num_milliseconds() / s.interval_ms;
                            Some(self.start_time + Duration::milliseconds(fits * s.interval_ms))
                        }
                        _ => Some(last),
                    }
                }
                Repeat::Forever => None,
            },
            _ => None,
        }
    }

    pub(crate) fn set_next_fire_time(&mut self, t: Option<DateTime<Utc>>) {
        self.next_fire_time = t;
    }

    pub(crate) fn set_previous_fire_time(&mut self, t: Option<DateTime<Utc>>) {
        self.previous_fire_time = t;
    }

    pub(crate) fn set_times_triggered(&mut self, n: u32) {
        self.times_triggered = n;
    }

    pub(crate) fn set_job_key(&mut self, job_key: JobKey) {
        self.job_key = job_key;
    }

    /// Check the definition for consistency.
    pub fn validate(&self) -> Result<(), TriggerError> {
        self.schedule.validate()?;
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(TriggerError::EndBeforeStart);
            }
        }
        let kind = self.schedule.kind();
        if !self.misfire_instruction.is_valid_for(kind) {
            return Err(TriggerError::InvalidMisfireInstruction {
                instruction: self.misfire_instruction,
                kind,
            });
        }
        Ok(())
    }

    fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .fire_time_after(self.start_time, self.end_time, after)
    }

    /// Advance `candidate` until the calendar includes it.
    fn skip_excluded(
        &self,
        mut candidate: Option<DateTime<Utc>>,
        calendar: Option<&dyn Calendar>,
    ) -> Option<DateTime<Utc>> {
        let Some(cal) = calendar else {
            return candidate;
        };
        while let Some(t) = candidate {
            if cal.is_time_included(t) {
                break;
            }
            if t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            candidate = self.fire_time_after(t);
        }
        candidate
    }

    /// Compute and store the first fire time. Called once when the trigger is stored.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&dyn Calendar>,
    ) -> Option<DateTime<Utc>> {
        let first = self.schedule.first_fire_time(self.start_time, self.end_time);
        self.next_fire_time = self.skip_excluded(first, calendar);
        self.next_fire_time
    }

    /// Record a firing and advance to the next fire time.
    pub fn triggered(&mut self, calendar: Option<&dyn Calendar>) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        let next = self.next_fire_time.and_then(|t| self.fire_time_after(t));
        let next = self.skip_excluded(next, calendar);
        self.next_fire_time = if self.schedule.allows_more_after(self.times_triggered) {
            next
        } else {
            None
        };
    }

    /// Rewrite the schedule state after a misfire, following the misfire instruction.
    pub fn update_after_misfire(
        &mut self,
        calendar: Option<&dyn Calendar>,
        now: DateTime<Utc>,
        policy: &SmartMisfirePolicy,
    ) {
        let mut instruction = self.misfire_instruction;
        if instruction == MisfireInstruction::IgnoreMisfires {
            return;
        }
        if instruction == MisfireInstruction::Smart {
            instruction = policy.resolve(&self.schedule);
        }

        match &self.schedule {
            Schedule::Simple(simple) => {
                let simple = simple.clone();
                if instruction == MisfireInstruction::FireNow && simple.repeat != Repeat::Count(0) {
                    instruction = MisfireInstruction::RescheduleNowWithRemainingRepeatCount;
                }
                match instruction {
                    MisfireInstruction::RescheduleNextWithExistingCount => {
                        let next = self.fire_time_after(now);
                        self.next_fire_time = self.skip_excluded(next, calendar);
                    }
                    MisfireInstruction::RescheduleNextWithRemainingCount => {
                        let next = self.fire_time_after(now);
                        let next = self.skip_excluded(next, calendar);
                        if let (Some(missed), Some(new)) = (self.next_fire_time, next) {
                            let skipped = simple.times_between(missed, new);
                            self.times_triggered = self.times_triggered.saturating_add(skipped);
                        }
                        self.next_fire_time = next;
                    }
                    MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                        if let Repeat::Count(n) = simple.repeat {
                            if n != 0 {
                                self.set_repeat(Repeat::Count(n.saturating_sub(self.times_triggered)));
                                self.times_triggered = 0;
                            }
                        }
                        self.restart_at(now);
                    }
                    MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                        let missed = self
                            .next_fire_time
                            .map(|t| simple.times_between(t, now))
                            .unwrap_or(0);
                        if let Repeat::Count(n) = simple.repeat {
                            if n != 0 {
                                let used = self.times_triggered.saturating_add(missed);
                                self.set_repeat(Repeat::Count(n.saturating_sub(used)));
                                self.times_triggered = 0;
                            }
                        }
                        self.restart_at(now);
                    }
                    _ => {
                        // One-shot fire now.
                        self.next_fire_time = Some(now);
                    }
                }
            }
            _ => match instruction {
                MisfireInstruction::FireNow => {
                    self.next_fire_time = Some(now);
                }
                _ => {
                    let next = self.fire_time_after(now);
                    self.next_fire_time = self.skip_excluded(next, calendar);
                }
            },
        }
    }

    fn set_repeat(&mut self, repeat: Repeat) {
        if let Schedule::Simple(s) = &mut self.schedule {
            s.repeat = repeat;
        }
    }

    fn restart_at(&mut self, now: DateTime<Utc>) {
        if self.end_time.is_some_and(|end| end < now) {
            self.next_fire_time = None;
        } else {
            self.start_time = now;
            self.next_fire_time = Some(now);
        }
    }

    /// Recompute the next fire time after the referenced calendar changed.
    ///
    /// Candidates that are already older than the misfire threshold are skipped.
    pub fn update_with_new_calendar(
        &mut self,
        calendar: Option<&dyn Calendar>,
        now: DateTime<Utc>,
        misfire_threshold: Duration,
    ) {
        let mut next = match self.previous_fire_time {
            Some(prev) => self.fire_time_after(prev),
            None => self.schedule.first_fire_time(self.start_time, self.end_time),
        };
        let Some(cal) = calendar else {
            self.next_fire_time = next;
            return;
        };
        while let Some(t) = next {
            if t < now && now - t >= misfire_threshold {
                next = self.fire_time_after(t);
                continue;
            }
            if cal.is_time_included(t) {
                break;
            }
            if t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                next = None;
                break;
            }
            next = self.fire_time_after(t);
        }
        self.next_fire_time = next;
    }

    /// Map a job outcome to what the store should do with this trigger.
    pub fn execution_complete(&self, result: &Result<(), JobError>) -> CompletedExecutionInstruction {
        if let Err(e) = result {
            match e {
                JobError::Refire(_) => return CompletedExecutionInstruction::ReExecuteJob,
                JobError::UnscheduleTrigger(_) => {
                    return CompletedExecutionInstruction::SetTriggerComplete
                }
                JobError::UnscheduleAllTriggers(_) => {
                    return CompletedExecutionInstruction::SetAllJobTriggersComplete
                }
                _ => {}
            }
        }
        if self.may_fire_again() {
            CompletedExecutionInstruction::Noop
        } else {
            CompletedExecutionInstruction::SetTriggerComplete
        }
    }

    /// A copy of this trigger re-pointed at a new key, with fresh scheduling state.
    pub fn rekeyed(&self, key: TriggerKey) -> Trigger {
        let mut t = self.clone();
        t.key = key;
        t.next_fire_time = None;
        t.previous_fire_time = None;
        t.times_triggered = 0;
        t
    }
}

/// Builder for [`Trigger`].
#[derive(Debug, Clone)]
pub struct TriggerBuilder {
    key: TriggerKey,
    job_key: JobKey,
    description: Option<String>,
    priority: i32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    calendar_name: Option<String>,
    misfire_instruction: MisfireInstruction,
    data: JobDataMap,
    schedule: Schedule,
}

impl TriggerBuilder {
    fn new(key: TriggerKey, job_key: JobKey) -> Self {
        Self {
            key,
            job_key,
            description: None,
            priority: DEFAULT_PRIORITY,
            start_time: None,
            end_time: None,
            calendar_name: None,
            misfire_instruction: MisfireInstruction::Smart,
            data: JobDataMap::new(),
            schedule: Schedule::once(),
        }
    }

    /// Set the schedule. Defaults to a single firing at the start time.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the start time. Defaults to the moment [`build`](Self::build) is called.
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar_name = Some(name.into());
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a trigger-level data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Replace all trigger-level data.
    pub fn with_data_map(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<Trigger, TriggerError> {
        let start_time = truncate_millis(self.start_time.unwrap_or_else(Utc::now));
        let trigger = Trigger {
            key: self.key,
            job_key: self.job_key,
            description: self.description,
            priority: self.priority,
            start_time,
            end_time: self.end_time.map(truncate_millis),
            calendar_name: self.calendar_name,
            misfire_instruction: self.misfire_instruction,
            data: self.data,
            schedule: self.schedule,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
        };
        trigger.validate()?;
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calendar::RangeExclusionCalendar;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn simple(repeat: Repeat) -> Trigger {
        Trigger::builder("t", "job")
            .with_schedule(Schedule::every(Duration::minutes(1), repeat))
            .starting_at(base())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let t = Trigger::builder("t", "job").starting_at(base()).build().unwrap();
        assert_eq!(t.priority(), DEFAULT_PRIORITY);
        assert_eq!(t.misfire_instruction(), MisfireInstruction::Smart);
        assert_eq!(t.key().group(), "DEFAULT");
        assert!(t.next_fire_time().is_none());
    }

    #[test]
    fn test_builder_rejects_end_before_start() {
        let err = Trigger::builder("t", "job")
            .starting_at(base())
            .ending_at(base() - Duration::seconds(1))
            .build()
            .unwrap_err();
        assert_eq!(err, TriggerError::EndBeforeStart);
    }

    #[test]
    fn test_builder_rejects_wrong_misfire_instruction() {
        let err = Trigger::builder("t", "job")
            .with_schedule(Schedule::cron("0 * * * *").unwrap())
            .with_misfire_instruction(MisfireInstruction::RescheduleNextWithExistingCount)
            .build()
            .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidMisfireInstruction { .. }));
    }

    #[test]
    fn test_triggered_advances_state() {
        let mut t = simple(Repeat::Count(1));
        assert_eq!(t.compute_first_fire_time(None), Some(base()));

        t.triggered(None);
        assert_eq!(t.times_triggered(), 1);
        assert_eq!(t.previous_fire_time(), Some(base()));
        assert_eq!(t.next_fire_time(), Some(base() + Duration::minutes(1)));

        t.triggered(None);
        assert_eq!(t.next_fire_time(), None);
        assert!(!t.may_fire_again());
    }

    #[test]
    fn test_calendar_excludes_fire_times() {
        let cal = RangeExclusionCalendar::new("skip")
            .exclude(base(), base() + Duration::minutes(2));
        let mut t = simple(Repeat::Forever);
        assert_eq!(
            t.compute_first_fire_time(Some(&cal)),
            Some(base() + Duration::minutes(2))
        );
    }

    #[test]
    fn test_simple_fire_now_one_shot() {
        let mut t = Trigger::builder("t", "job")
            .starting_at(base())
            .with_misfire_instruction(MisfireInstruction::FireNow)
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        let now = base() + Duration::minutes(5);
        t.update_after_misfire(None, now, &SmartMisfirePolicy::default());
        assert_eq!(t.next_fire_time(), Some(now));
    }

    #[test]
    fn test_simple_fire_now_repeating_resumes_interval_from_now() {
        let mut t = Trigger::builder("t", "job")
            .with_schedule(Schedule::every(Duration::minutes(1), Repeat::Count(10)))
            .starting_at(base())
            .with_misfire_instruction(MisfireInstruction::FireNow)
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        let now = base() + Duration::minutes(5);
        t.update_after_misfire(None, now, &SmartMisfirePolicy::default());

        assert_eq!(t.next_fire_time(), Some(now));
        assert_eq!(t.start_time(), now);
        // Five slots were missed out of ten repeats.
        assert_eq!(t.schedule(), &Schedule::every(Duration::minutes(1), Repeat::Count(5)));

        t.triggered(None);
        assert_eq!(t.next_fire_time(), Some(now + Duration::minutes(1)));
    }

    #[test]
    fn test_reschedule_next_with_remaining_count_counts_missed() {
        let mut t = Trigger::builder("t", "job")
            .with_schedule(Schedule::every(Duration::minutes(1), Repeat::Forever))
            .starting_at(base())
            .with_misfire_instruction(MisfireInstruction::RescheduleNextWithRemainingCount)
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        let now = base() + Duration::seconds(330);
        t.update_after_misfire(None, now, &SmartMisfirePolicy::default());
        assert_eq!(t.next_fire_time(), Some(base() + Duration::minutes(6)));
        assert_eq!(t.times_triggered(), 6);
    }

    #[test]
    fn test_reschedule_now_with_existing_count() {
        let mut t = Trigger::builder("t", "job")
            .with_schedule(Schedule::every(Duration::minutes(1), Repeat::Count(4)))
            .starting_at(base())
            .with_misfire_instruction(MisfireInstruction::RescheduleNowWithExistingRepeatCount)
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        t.triggered(None);
        let now = base() + Duration::minutes(10);
        t.update_after_misfire(None, now, &SmartMisfirePolicy::default());
        assert_eq!(t.times_triggered(), 0);
        assert_eq!(t.schedule(), &Schedule::every(Duration::minutes(1), Repeat::Count(3)));
        assert_eq!(t.next_fire_time(), Some(now));
    }

    #[test]
    fn test_reschedule_now_past_end_time_retires_trigger() {
        let mut t = Trigger::builder("t", "job")
            .with_schedule(Schedule::every(Duration::minutes(1), Repeat::Count(4)))
            .starting_at(base())
            .ending_at(base() + Duration::minutes(3))
            .with_misfire_instruction(MisfireInstruction::RescheduleNowWithExistingRepeatCount)
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        t.update_after_misfire(None, base() + Duration::minutes(10), &SmartMisfirePolicy::default());
        assert_eq!(t.next_fire_time(), None);
    }

    #[test]
    fn test_execution_complete_mapping() {
        let mut t = simple(Repeat::Forever);
        t.compute_first_fire_time(None);
        assert_eq!(t.execution_complete(&Ok(())), CompletedExecutionInstruction::Noop);
        assert_eq!(
            t.execution_complete(&Err(JobError::Refire("retry".into()))),
            CompletedExecutionInstruction::ReExecuteJob
        );
        assert_eq!(
            t.execution_complete(&Err(JobError::UnscheduleTrigger("done".into()))),
            CompletedExecutionInstruction::SetTriggerComplete
        );
        assert_eq!(
            t.execution_complete(&Err(JobError::UnscheduleAllTriggers("done".into()))),
            CompletedExecutionInstruction::SetAllJobTriggersComplete
        );
        assert_eq!(
            t.execution_complete(&Err(JobError::Failed("boom".into()))),
            CompletedExecutionInstruction::Noop
        );

        t.set_next_fire_time(None);
        assert_eq!(
            t.execution_complete(&Ok(())),
            CompletedExecutionInstruction::SetTriggerComplete
        );
    }

    #[test]
    fn test_update_with_new_calendar_recomputes() {
        let mut t = simple(Repeat::Forever);
        t.compute_first_fire_time(None);
        t.triggered(None);
        let cal = RangeExclusionCalendar::new("block")
            .exclude(base() + Duration::minutes(1), base() + Duration::minutes(3));
        t.update_with_new_calendar(Some(&cal), base(), Duration::seconds(60));
        assert_eq!(t.next_fire_time(), Some(base() + Duration::minutes(3)));
    }

    #[test]
    fn test_final_fire_time_for_finite_simple() {
        let t = simple(Repeat::Count(3));
        assert_eq!(t.final_fire_time(), Some(base() + Duration::minutes(3)));
    }

    #[test]
    fn test_trigger_round_trips_through_json() {
        let mut t = Trigger::builder(("nightly", "reports"), ("render", "reports"))
            .with_schedule(Schedule::cron_in("0 30 2 * * *", "Europe/Berlin").unwrap())
            .with_priority(9)
            .with_data("region", "eu")
            .starting_at(base() + Duration::milliseconds(123))
            .build()
            .unwrap();
        t.compute_first_fire_time(None);
        let json = serde_json::to_string(&t).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
