//! Domain types for georepl
//!
//! This module contains the core types shared across the update pipeline:
//! - UpdateOutcome: Result of one apply attempt, with its exit code
//! - LoopParameters / LoopOptions: Immutable loop configuration
//! - StatusRecord: Persisted replication progress

pub mod outcome;
pub mod params;
pub mod status;

pub use outcome::UpdateOutcome;
pub use params::{LoopOptions, LoopParameters};
pub use status::{StatusEvent, StatusLogEntry, StatusRecord};
