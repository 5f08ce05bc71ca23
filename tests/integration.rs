//! Integration tests for the cadence scheduler.
//!
//! These tests drive a running scheduler through its public handle:
//! - End-to-end firing from schedule to completion
//! - Fire order by time and priority
//! - Non-concurrent jobs, interruption and shutdown
//! - Misfire handling
//! - Pause, resume and calendars
//! - Clustered instances sharing one database, and crash recovery

mod common;

mod integration {
    pub mod blocking;
    #[cfg(feature = "sqlite")]
    pub mod clustered;
    pub mod end_to_end;
    pub mod misfire;
    pub mod ordering;
    pub mod pause;
}
