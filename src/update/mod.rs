//! Update loop module - keeps the store current.
//!
//! This module provides:
//! - UpdateLoop, the state machine driving fetch, index, report and sleep
//! - validate, the configuration checks run before the first iteration
//! - UpdateReport, the per-iteration progress report
//! - Clock, the loop's time source

mod clock;
mod report;
mod update_loop;
mod validate;

#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use report::{Timings, UpdateReport, format_duration};
pub use update_loop::{Decision, Iteration, LoopState, UpdateLoop, decide};
pub use validate::{RATE_LIMITED_HOSTS, minimum_interval, validate};
