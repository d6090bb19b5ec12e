//! Replication client module - pulls diffs and applies them to the store.
//!
//! This module provides:
//! - ReplicationSource / HttpSource for reading state files and diffs
//! - Importer / CommandImporter for running the import tool
//! - Updater, the ReplicationClient used by the update loop
//! - init_replication and check_for_updates for the one-shot commands

mod importer;
mod setup;
mod source;
mod updater;

pub use importer::{CommandImporter, Importer};
pub use setup::{CheckResult, check_for_updates, init_replication};
pub use source::{HttpSource, ReplicationSource, ReplicationState, sequence_path, timestamp_to_sequence};
pub use updater::{ReplicationClient, Updater, clear_staged, staged_path};
