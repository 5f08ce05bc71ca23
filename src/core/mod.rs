//! Core domain types: keys, clocks, calendars, jobs, schedules and triggers.

pub mod calendar;
pub mod clock;
pub mod context;
pub mod job;
pub mod misfire;
pub mod schedule;
pub mod trigger;
pub mod types;
