//! Store layer for georepl - replication status persisted in SQLite.
//!
//! The status store records how far the dataset has been replicated (batch
//! timestamp, sequence id, indexed flag) plus an append-only log of import and
//! index runs. Every step of the update loop opens its own connection through
//! a [`Connector`] and drops it when done; connections are never held across
//! the recheck sleep or across indexing.

#[cfg(any(test, feature = "test-util"))]
mod memory;
mod sqlite;

use chrono::{DateTime, Utc};

use crate::domain::{StatusEvent, StatusLogEntry, StatusRecord};
use crate::error::Result;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryStore};
pub use sqlite::{SqliteConnector, SqliteStatusStore, init_schema};
pub(crate) use sqlite::format_timestamp;

/// Access to persisted replication status over one open connection.
pub trait StatusStore: Send + Sync {
    /// Read the current status. Returns an empty record if replication was
    /// never initialised.
    fn get_status(&self) -> Result<StatusRecord>;

    /// Replace the status. With `date == None` only the sequence id and the
    /// indexed flag are updated.
    fn set_status(&self, date: Option<DateTime<Utc>>, seq: Option<u64>, indexed: bool) -> Result<()>;

    /// Set the indexed flag.
    fn set_indexed(&self, indexed: bool) -> Result<()>;

    /// Append a log entry for a run that started at `start` and ends now.
    fn log_status(&self, start: DateTime<Utc>, event: StatusEvent) -> Result<()>;

    /// Newest object timestamp found in the dataset, if any.
    fn database_date(&self) -> Result<Option<DateTime<Utc>>>;

    /// Status log, oldest first.
    fn status_log(&self) -> Result<Vec<StatusLogEntry>>;
}

/// Opens fresh store connections.
pub trait Connector: Send + Sync {
    type Store: StatusStore;

    fn connect(&self) -> Result<Self::Store>;
}
