//! In-memory status store.
//!
//! Every connection handed out by a [`MemoryConnector`] shares one state, so
//! it behaves like a store file reopened per step. Test fixture, only built
//! for tests or with the `test-util` feature.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{Connector, StatusStore};
use crate::domain::{StatusEvent, StatusLogEntry, StatusRecord};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct MemoryState {
    status: Option<StatusRecord>,
    log: Vec<StatusLogEntry>,
    database_date: Option<DateTime<Utc>>,
    connects: usize,
}

/// Hands out connections to a shared in-memory state.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing replication status.
    pub fn with_status(status: StatusRecord) -> Self {
        let connector = Self::new();
        if let Ok(mut state) = connector.state.lock() {
            state.status = Some(status);
        }
        connector
    }

    /// Newest object timestamp reported by `database_date`.
    pub fn set_database_date(&self, date: Option<DateTime<Utc>>) {
        if let Ok(mut state) = self.state.lock() {
            state.database_date = date;
        }
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().map(|s| s.connects).unwrap_or(0)
    }
}

impl Connector for MemoryConnector {
    type Store = MemoryStore;

    fn connect(&self) -> Result<MemoryStore> {
        lock(&self.state)?.connects += 1;
        Ok(MemoryStore {
            state: Arc::clone(&self.state),
        })
    }
}

/// One "connection" to the in-memory state.
#[derive(Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|e| Error::Io(std::io::Error::other(format!("memory store lock poisoned: {}", e))))
}

impl StatusStore for MemoryStore {
    fn get_status(&self) -> Result<StatusRecord> {
        Ok(lock(&self.state)?.status.clone().unwrap_or_default())
    }

    fn set_status(&self, date: Option<DateTime<Utc>>, seq: Option<u64>, indexed: bool) -> Result<()> {
        let mut state = lock(&self.state)?;
        match date {
            None => {
                if let Some(status) = state.status.as_mut() {
                    status.sequence_id = seq;
                    status.indexed = indexed;
                }
            }
            Some(date) => {
                state.status = Some(StatusRecord {
                    batch_date: Some(date),
                    sequence_id: seq,
                    indexed,
                });
            }
        }
        Ok(())
    }

    fn set_indexed(&self, indexed: bool) -> Result<()> {
        if let Some(status) = lock(&self.state)?.status.as_mut() {
            status.indexed = indexed;
        }
        Ok(())
    }

    fn log_status(&self, start: DateTime<Utc>, event: StatusEvent) -> Result<()> {
        let mut state = lock(&self.state)?;
        let Some(status) = state.status.clone() else {
            return Ok(());
        };
        state.log.push(StatusLogEntry {
            batch_end: status.batch_date,
            batch_seq: status.sequence_id,
            start_time: start,
            end_time: Utc::now(),
            event: event.as_str().to_string(),
        });
        Ok(())
    }

    fn database_date(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(lock(&self.state)?.database_date)
    }

    fn status_log(&self) -> Result<Vec<StatusLogEntry>> {
        Ok(lock(&self.state)?.log.clone())
    }
}
