//! Replication status types persisted by the status store.

use chrono::{DateTime, Utc};
use std::fmt;

/// Persisted replication progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRecord {
    /// Timestamp of the most recently applied diff
    pub batch_date: Option<DateTime<Utc>>,
    /// Sequence number of the most recently applied diff
    pub sequence_id: Option<u64>,
    /// Whether all applied data has been indexed
    pub indexed: bool,
}

/// Phase label written to the status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Import,
    Index,
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEvent::Import => "import",
            StatusEvent::Index => "index",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the status log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLogEntry {
    pub batch_end: Option<DateTime<Utc>>,
    pub batch_seq: Option<u64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub event: String,
}
