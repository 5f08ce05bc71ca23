//! Misfire instructions and the policy that applies them.
//!
//! A trigger has misfired when its next fire time is older than the
//! configured threshold at the moment the store looks at it. Misfires are
//! not errors: the trigger's instruction decides whether the missed slot is
//! fired now, skipped, or rescheduled.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::Calendar;
use super::schedule::{Repeat, Schedule, ScheduleKind};
use super::trigger::Trigger;

/// What to do with a trigger whose fire time was missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Resolve to a per-schedule default through [`SmartMisfirePolicy`].
    #[default]
    Smart,
    /// Never treat the trigger as misfired; fire every missed slot as soon as possible.
    IgnoreMisfires,
    /// Fire once immediately, then continue the normal schedule.
    FireNow,
    /// Restart now, keeping the original repeat count. Simple schedules only.
    RescheduleNowWithExistingRepeatCount,
    /// Restart now, counting missed firings against the repeat count. Simple schedules only.
    RescheduleNowWithRemainingRepeatCount,
    /// Skip to the next scheduled time, counting missed firings as fired. Simple schedules only.
    RescheduleNextWithRemainingCount,
    /// Skip to the next scheduled time, keeping the repeat count. Simple schedules only.
    RescheduleNextWithExistingCount,
    /// Skip the missed firing and wait for the next future occurrence.
    DoNothing,
}

impl MisfireInstruction {
    /// Stable name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        use MisfireInstruction::*;
        match self {
            Smart => "smart",
            IgnoreMisfires => "ignore_misfires",
            FireNow => "fire_now",
            RescheduleNowWithExistingRepeatCount => "reschedule_now_with_existing_repeat_count",
            RescheduleNowWithRemainingRepeatCount => "reschedule_now_with_remaining_repeat_count",
            RescheduleNextWithRemainingCount => "reschedule_next_with_remaining_count",
            RescheduleNextWithExistingCount => "reschedule_next_with_existing_count",
            DoNothing => "do_nothing",
        }
    }

    /// Whether this instruction makes sense for the given schedule variant.
    pub fn is_valid_for(&self, kind: ScheduleKind) -> bool {
        use MisfireInstruction::*;
        match self {
            Smart | IgnoreMisfires | FireNow => true,
            RescheduleNowWithExistingRepeatCount
            | RescheduleNowWithRemainingRepeatCount
            | RescheduleNextWithRemainingCount
            | RescheduleNextWithExistingCount => kind == ScheduleKind::Simple,
            DoNothing => kind != ScheduleKind::Simple,
        }
    }
}

/// Resolution table for [`MisfireInstruction::Smart`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartMisfirePolicy {
    pub simple_one_shot: MisfireInstruction,
    pub simple_finite_repeat: MisfireInstruction,
    pub simple_infinite_repeat: MisfireInstruction,
    pub cron: MisfireInstruction,
    pub calendar_interval: MisfireInstruction,
    pub daily_time_interval: MisfireInstruction,
}

impl Default for SmartMisfirePolicy {
    fn default() -> Self {
        Self {
            simple_one_shot: MisfireInstruction::FireNow,
            simple_finite_repeat: MisfireInstruction::RescheduleNowWithRemainingRepeatCount,
            simple_infinite_repeat: MisfireInstruction::RescheduleNextWithRemainingCount,
            cron: MisfireInstruction::DoNothing,
            calendar_interval: MisfireInstruction::FireNow,
            daily_time_interval: MisfireInstruction::FireNow,
        }
    }
}

impl SmartMisfirePolicy {
    /// Concrete instruction for a schedule.
    pub fn resolve(&self, schedule: &Schedule) -> MisfireInstruction {
        match schedule {
            Schedule::Simple(s) => match s.repeat {
                Repeat::Count(0) => self.simple_one_shot,
                Repeat::Count(_) => self.simple_finite_repeat,
                Repeat::Forever => self.simple_infinite_repeat,
            },
            Schedule::Cron(_) => self.cron,
            Schedule::CalendarInterval(_) => self.calendar_interval,
            Schedule::DailyTimeInterval(_) => self.daily_time_interval,
        }
    }

    /// Reject entries that are smart themselves or invalid for their variant.
    pub fn validate(&self) -> Result<(), String> {
        let entries = [
            ("simple_one_shot", self.simple_one_shot, ScheduleKind::Simple),
            ("simple_finite_repeat", self.simple_finite_repeat, ScheduleKind::Simple),
            ("simple_infinite_repeat", self.simple_infinite_repeat, ScheduleKind::Simple),
            ("cron", self.cron, ScheduleKind::Cron),
            ("calendar_interval", self.calendar_interval, ScheduleKind::CalendarInterval),
            ("daily_time_interval", self.daily_time_interval, ScheduleKind::DailyTimeInterval),
        ];
        for (name, instruction, kind) in entries {
            if instruction == MisfireInstruction::Smart || !instruction.is_valid_for(kind) {
                return Err(format!("{:?} is not a valid smart policy for {}", instruction, name));
            }
        }
        Ok(())
    }
}

/// Result of applying a misfire instruction to one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisfireOutcome {
    /// The fire time that was missed.
    pub missed_fire_time: DateTime<Utc>,
    /// The fire time after handling, `None` when the trigger will never fire again.
    pub new_fire_time: Option<DateTime<Utc>>,
}

/// Decides whether a trigger misfired and rewrites its schedule if so.
///
/// Stores call this while holding the trigger-access lock, so every node
/// in a cluster reaches the same decision.
#[derive(Debug, Clone)]
pub struct MisfireHandler {
    threshold: Duration,
    policy: SmartMisfirePolicy,
}

impl MisfireHandler {
    /// Create a handler with the given threshold and smart policy.
    pub fn new(threshold: Duration, policy: SmartMisfirePolicy) -> Self {
        Self { threshold, policy }
    }

    /// The misfire threshold.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// The smart policy table.
    pub fn policy(&self) -> &SmartMisfirePolicy {
        &self.policy
    }

    /// Fire times strictly before this instant count as misfired.
    pub fn misfire_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.threshold
    }

    /// Whether the trigger's next fire time is past the threshold.
    pub fn is_misfired(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        if trigger.misfire_instruction() == MisfireInstruction::IgnoreMisfires {
            return false;
        }
        trigger
            .next_fire_time()
            .is_some_and(|t| t < self.misfire_cutoff(now))
    }

    /// Apply the trigger's instruction if it misfired.
    ///
    /// Returns `None` when the trigger was on time and left untouched.
    pub fn apply(
        &self,
        trigger: &mut Trigger,
        calendar: Option<&dyn Calendar>,
        now: DateTime<Utc>,
    ) -> Option<MisfireOutcome> {
        if !self.is_misfired(trigger, now) {
            return None;
        }
        let missed_fire_time = trigger.next_fire_time()?;
        trigger.update_after_misfire(calendar, now, &self.policy);
        Some(MisfireOutcome {
            missed_fire_time,
            new_fire_time: trigger.next_fire_time(),
        })
    }
}

impl Default for MisfireHandler {
    fn default() -> Self {
        Self::new(Duration::seconds(60), SmartMisfirePolicy::default())
    }
}
