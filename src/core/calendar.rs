//! Exclusion calendars.
//!
//! A calendar is a named predicate over instants. The engine never looks
//! inside one; it only asks whether a candidate fire time is included.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Upper bound on how far [`Calendar::next_included_time`] will probe.
const MAX_PROBE_STEPS: usize = 100_000;

/// Named time-exclusion predicate.
pub trait Calendar: Send + Sync + std::fmt::Debug {
    /// Whether the given instant is allowed to fire.
    fn is_time_included(&self, t: DateTime<Utc>) -> bool;

    /// Short human-readable description, persisted alongside the name.
    fn description(&self) -> String {
        String::new()
    }

    /// First included instant strictly after `t`, probing in one-millisecond steps.
    ///
    /// Implementations with cheaper closed forms should override this.
    fn next_included_time(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t + Duration::milliseconds(1);
        for _ in 0..MAX_PROBE_STEPS {
            if self.is_time_included(candidate) {
                return Some(candidate);
            }
            candidate += Duration::milliseconds(1);
        }
        None
    }
}

/// Shared calendar handle.
pub type SharedCalendar = Arc<dyn Calendar>;

/// Excludes a fixed set of half-open `[start, end)` ranges.
#[derive(Debug, Clone, Default)]
pub struct RangeExclusionCalendar {
    ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    description: String,
}

impl RangeExclusionCalendar {
    /// Create an empty calendar that includes every instant.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            ranges: Vec::new(),
            description: description.into(),
        }
    }

    /// Exclude the range `[start, end)`.
    pub fn exclude(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.ranges.push((start, end));
        self
    }
}

impl Calendar for RangeExclusionCalendar {
    fn is_time_included(&self, t: DateTime<Utc>) -> bool {
        !self.ranges.iter().any(|(s, e)| t >= *s && t < *e)
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn next_included_time(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t + Duration::milliseconds(1);
        // Jump over overlapping ranges until nothing covers the candidate.
        loop {
            match self
                .ranges
                .iter()
                .find(|(s, e)| candidate >= *s && candidate < *e)
            {
                Some((_, end)) => candidate = *end,
                None => return Some(candidate),
            }
        }
    }
}
