//! Scheduler engine.
//!
//! [`Scheduler`] builds and starts the fire-selection loop; the returned
//! [`SchedulerHandle`] is the scheduling API. The store reaches the loop
//! through a [`SchedulerSignaler`].

mod directory;
mod engine;
mod handle;
mod signal;
mod types;

pub use directory::SchedulerDirectory;
pub use engine::Scheduler;
pub use handle::{SchedulerHandle, MANUAL_TRIGGER_GROUP};
pub use signal::{NoopSignaler, SchedulerSignaler, SchedulingSignal};
pub use types::{SchedulerError, SchedulerState};
