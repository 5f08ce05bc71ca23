//! Schedule variants and fire-time arithmetic.
//!
//! A trigger's timing rule is one of a closed set of variants:
//!
//! - [`SimpleSchedule`]: fixed interval with a repeat count
//! - [`CronSchedule`]: standard 5-field or extended 6-field cron expressions,
//!   plus shortcuts (`@daily`, `@hourly`, ...), evaluated in a timezone
//! - [`CalendarIntervalSchedule`]: every N seconds/minutes/hours/days/weeks/months/years,
//!   with day and month arithmetic done in local time
//! - [`DailyTimeIntervalSchedule`]: every N seconds/minutes/hours inside a daily
//!   time-of-day window on selected weekdays
//!
//! Every variant answers one question: given the trigger's start and end
//! bounds, what is the first fire time strictly after some instant?

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule as CronExpr;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// How many days ahead a daily-window schedule will look for a matching weekday.
const DAILY_LOOKAHEAD_DAYS: usize = 366 * 2;

/// Errors that can occur when building or evaluating schedules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Invalid daily time window.
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
}

/// Discriminant of a [`Schedule`], used for misfire policy lookup and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Simple,
    Cron,
    CalendarInterval,
    DailyTimeInterval,
}

impl ScheduleKind {
    /// Stable string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Simple => "simple",
            ScheduleKind::Cron => "cron",
            ScheduleKind::CalendarInterval => "calendar_interval",
            ScheduleKind::DailyTimeInterval => "daily_time_interval",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many times a simple or daily schedule repeats after its first firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// Repeat this many additional times.
    Count(u32),
    /// Repeat until the end time, if any.
    Forever,
}

impl Repeat {
    /// Whether `fired` total firings exceed what this repeat allows.
    pub fn is_exhausted_by(&self, fired: u32) -> bool {
        match self {
            Repeat::Count(n) => fired > *n,
            Repeat::Forever => false,
        }
    }
}

/// Unit for interval-based schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    /// Fixed length in milliseconds, for units that have one.
    fn fixed_millis(&self) -> Option<i64> {
        match self {
            IntervalUnit::Millisecond => Some(1),
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            _ => None,
        }
    }
}

/// Fixed-interval schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    /// Interval between firings, in milliseconds.
    pub interval_ms: i64,
    /// Number of repeats after the first firing.
    pub repeat: Repeat,
}

impl SimpleSchedule {
    /// Fire exactly once at the trigger's start time.
    pub fn once() -> Self {
        Self {
            interval_ms: 0,
            repeat: Repeat::Count(0),
        }
    }

    /// Fire every `interval`, repeating `repeat` times after the first firing.
    pub fn every(interval: Duration, repeat: Repeat) -> Self {
        Self {
            interval_ms: interval.num_milliseconds(),
            repeat,
        }
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        if self.repeat != Repeat::Count(0) && self.interval_ms <= 0 {
            return Err(ScheduleError::InvalidInterval(
                "repeating schedule needs a positive interval".into(),
            ));
        }
        if self.interval_ms < 0 {
            return Err(ScheduleError::InvalidInterval("negative interval".into()));
        }
        Ok(())
    }

    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if end.is_some_and(|e| e <= after) {
            return None;
        }
        if after < start {
            return Some(start);
        }
        if self.repeat == Repeat::Count(0) || self.interval_ms <= 0 {
            return None;
        }

        let elapsed = (after - start).num_milliseconds();
        let executed = elapsed / self.interval_ms + 1;
        if let Repeat::Count(n) = self.repeat {
            if executed > i64::from(n) {
                return None;
            }
        }
        let next = start + Duration::milliseconds(executed * self.interval_ms);
        within_end(next, end)
    }

    /// Number of firings this schedule would make in `(from, to]`.
    pub fn times_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
        if self.interval_ms <= 0 || to <= from {
            return 0;
        }
        let n = (to - from).num_milliseconds() / self.interval_ms;
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

/// Cron expression schedule evaluated in a timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CronSpec", into = "CronSpec")]
pub struct CronSchedule {
    expression: String,
    timezone: String,
    parsed: Box<CronExpr>,
}

#[derive(Serialize, Deserialize)]
struct CronSpec {
    expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TryFrom<CronSpec> for CronSchedule {
    type Error = ScheduleError;

    fn try_from(spec: CronSpec) -> Result<Self, Self::Error> {
        CronSchedule::with_timezone(spec.expression, spec.timezone)
    }
}

impl From<CronSchedule> for CronSpec {
    fn from(s: CronSchedule) -> Self {
        CronSpec {
            expression: s.expression,
            timezone: s.timezone,
        }
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

impl Eq for CronSchedule {}

impl CronSchedule {
    /// Parse a cron expression evaluated in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse a cron expression evaluated in the given IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone.into();
        parse_timezone(&timezone)?;
        let parsed = Self::parse_expression(&expression)?;
        Ok(Self {
            expression,
            timezone,
            parsed: Box::new(parsed),
        })
    }

    fn parse_expression(expression: &str) -> Result<CronExpr, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            let expanded = match trimmed.to_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * SUN",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                _ => {
                    return Err(ScheduleError::InvalidCron(format!(
                        "unknown shortcut: {}",
                        expression
                    )))
                }
            };
            return Self::parse_fields(expanded);
        }
        Self::parse_fields(trimmed)
    }

    fn parse_fields(expression: &str) -> Result<CronExpr, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let cron_expr = match fields.len() {
            // Standard 5-field cron, add a seconds field.
            5 => format!("0 {}", expression),
            6 | 7 => expression.to_string(),
            n => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    n
                )))
            }
        };
        CronExpr::from_str(&cron_expr).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone the expression is evaluated in.
    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let tz = parse_timezone(&self.timezone).unwrap_or(Tz::UTC);
        let floor = start - Duration::milliseconds(1);
        let after = if after < floor { floor } else { after };
        let next = self
            .parsed
            .after(&after.with_timezone(&tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc))?;
        within_end(next, end)
    }
}

/// Every N units, with calendar-aware arithmetic for days and longer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarIntervalSchedule {
    pub unit: IntervalUnit,
    pub interval: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl CalendarIntervalSchedule {
    /// Every `interval` units, evaluated in UTC.
    pub fn new(unit: IntervalUnit, interval: u32) -> Self {
        Self {
            unit,
            interval,
            timezone: default_timezone(),
        }
    }

    /// Evaluate day and month arithmetic in the given timezone.
    pub fn in_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        if self.interval == 0 {
            return Err(ScheduleError::InvalidInterval("interval must be at least 1".into()));
        }
        parse_timezone(&self.timezone)?;
        Ok(())
    }

    /// The `k`-th occurrence counted from `start`.
    fn nth(&self, tz: &Tz, start_local: NaiveDateTime, start: DateTime<Utc>, k: u64) -> Option<DateTime<Utc>> {
        let step = u64::from(self.interval);
        let local = match self.unit {
            IntervalUnit::Day => start_local.checked_add_days(Days::new(k * step))?,
            IntervalUnit::Week => start_local.checked_add_days(Days::new(k * step * 7))?,
            IntervalUnit::Month => {
                start_local.checked_add_months(Months::new(u32::try_from(k * step).ok()?))?
            }
            IntervalUnit::Year => {
                start_local.checked_add_months(Months::new(u32::try_from(k * step * 12).ok()?))?
            }
            unit => {
                let ms = unit.fixed_millis()? * i64::from(self.interval);
                return start.checked_add_signed(Duration::milliseconds(ms.checked_mul(i64::try_from(k).ok()?)?));
            }
        };
        local_to_utc(tz, local)
    }

    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if after < start {
            return within_end(start, end);
        }
        if let Some(unit_ms) = self.unit.fixed_millis() {
            let step = unit_ms * i64::from(self.interval);
            let k = (after - start).num_milliseconds() / step + 1;
            return within_end(start + Duration::milliseconds(k * step), end);
        }

        let tz = parse_timezone(&self.timezone).unwrap_or(Tz::UTC);
        let start_local = start.with_timezone(&tz).naive_local();
        let approx_days = match self.unit {
            IntervalUnit::Day => 1,
            IntervalUnit::Week => 7,
            IntervalUnit::Month => 28,
            _ => 365,
        } * i64::from(self.interval);
        // Undershoot, then walk forward.
        let estimate = ((after - start).num_days() / approx_days - 1).max(0);
        let mut k = u64::try_from(estimate).unwrap_or(0);
        loop {
            let t = self.nth(&tz, start_local, start, k)?;
            if t > after {
                return within_end(t, end);
            }
            k += 1;
        }
    }
}

/// Repeating firings inside a daily time-of-day window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTimeIntervalSchedule {
    pub start_time_of_day: NaiveTime,
    pub end_time_of_day: NaiveTime,
    pub days_of_week: Vec<Weekday>,
    pub unit: IntervalUnit,
    pub interval: u32,
    pub repeat: Repeat,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl DailyTimeIntervalSchedule {
    /// Every `interval` units between `from` and `to` on every day of the week, in UTC.
    pub fn new(from: NaiveTime, to: NaiveTime, unit: IntervalUnit, interval: u32) -> Self {
        Self {
            start_time_of_day: from,
            end_time_of_day: to,
            days_of_week: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            unit,
            interval,
            repeat: Repeat::Forever,
            timezone: default_timezone(),
        }
    }

    /// Restrict firing to the given weekdays.
    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    /// Limit the total number of repeats.
    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    /// Evaluate the window in the given timezone.
    pub fn in_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    fn step_millis(&self) -> Option<i64> {
        match self.unit {
            IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour => {
                self.unit.fixed_millis().map(|ms| ms * i64::from(self.interval))
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ScheduleError> {
        if self.step_millis().is_none() {
            return Err(ScheduleError::InvalidInterval(
                "daily window unit must be seconds, minutes or hours".into(),
            ));
        }
        if self.interval == 0 {
            return Err(ScheduleError::InvalidInterval("interval must be at least 1".into()));
        }
        if self.end_time_of_day < self.start_time_of_day {
            return Err(ScheduleError::InvalidWindow(
                "end of day window precedes its start".into(),
            ));
        }
        if self.days_of_week.is_empty() {
            return Err(ScheduleError::InvalidWindow("no days of week selected".into()));
        }
        parse_timezone(&self.timezone)?;
        Ok(())
    }

    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let tz = parse_timezone(&self.timezone).unwrap_or(Tz::UTC);
        let step = self.step_millis()?;
        let floor = start - Duration::milliseconds(1);
        let after = if after < floor { floor } else { after };

        let mut date = after.with_timezone(&tz).date_naive();
        for _ in 0..DAILY_LOOKAHEAD_DAYS {
            if self.days_of_week.contains(&date.weekday()) {
                let window_start = local_to_utc(&tz, date.and_time(self.start_time_of_day));
                let window_end = local_to_utc(&tz, date.and_time(self.end_time_of_day));
                if let (Some(ws), Some(we)) = (window_start, window_end) {
                    let candidate = if after < ws {
                        ws
                    } else {
                        let k = (after - ws).num_milliseconds() / step + 1;
                        ws + Duration::milliseconds(k * step)
                    };
                    if candidate <= we {
                        return within_end(candidate, end);
                    }
                }
            }
            date = date.succ_opt()?;
            if end.is_some_and(|e| local_to_utc(&tz, date.and_time(NaiveTime::MIN)).is_some_and(|d| d > e)) {
                return None;
            }
        }
        None
    }
}

/// The timing rule of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
    CalendarInterval(CalendarIntervalSchedule),
    DailyTimeInterval(DailyTimeIntervalSchedule),
}

impl Schedule {
    /// One firing at the trigger's start time.
    pub fn once() -> Self {
        Schedule::Simple(SimpleSchedule::once())
    }

    /// Fixed interval with a repeat count.
    pub fn every(interval: Duration, repeat: Repeat) -> Self {
        Schedule::Simple(SimpleSchedule::every(interval, repeat))
    }

    /// Cron expression evaluated in UTC.
    pub fn cron(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        CronSchedule::new(expression).map(Schedule::Cron)
    }

    /// Cron expression evaluated in a timezone.
    pub fn cron_in(
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        CronSchedule::with_timezone(expression, timezone).map(Schedule::Cron)
    }

    /// Which variant this is.
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Simple(_) => ScheduleKind::Simple,
            Schedule::Cron(_) => ScheduleKind::Cron,
            Schedule::CalendarInterval(_) => ScheduleKind::CalendarInterval,
            Schedule::DailyTimeInterval(_) => ScheduleKind::DailyTimeInterval,
        }
    }

    /// Check the parameters are internally consistent.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Simple(s) => s.validate(),
            Schedule::Cron(c) => parse_timezone(&c.timezone).map(|_| ()),
            Schedule::CalendarInterval(c) => c.validate(),
            Schedule::DailyTimeInterval(d) => d.validate(),
        }
    }

    /// First fire time strictly after `after`, honoring `[start, end]`.
    pub fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Simple(s) => s.fire_time_after(start, end, after),
            Schedule::Cron(c) => c.fire_time_after(start, end, after),
            Schedule::CalendarInterval(c) => c.fire_time_after(start, end, after),
            Schedule::DailyTimeInterval(d) => d.fire_time_after(start, end, after),
        }
    }

    /// First fire time at or after `start`.
    pub fn first_fire_time(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Simple(_) | Schedule::CalendarInterval(_) => within_end(start, end),
            _ => self.fire_time_after(start, end, start - Duration::milliseconds(1)),
        }
    }

    /// Whether the repeat limit of this schedule allows another firing after `fired` firings.
    ///
    /// Simple schedules encode their limit in the arithmetic; only daily
    /// windows count firings explicitly.
    pub fn allows_more_after(&self, fired: u32) -> bool {
        match self {
            Schedule::DailyTimeInterval(d) => !d.repeat.is_exhausted_by(fired),
            _ => true,
        }
    }
}

fn within_end(t: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match end {
        Some(e) if t > e => None,
        _ => Some(t),
    }
}

fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Resolve a local wall-clock time, skipping forward over DST gaps.
fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}
