//! SQLite implementation of the status store.
//!
//! Status lives in the same database file as the dataset so that an import
//! and its status update touch a single store:
//! - **import_status**: at most one row with the replication position
//! - **import_osmosis_log**: append-only history of import and index runs
//! - **placex**: the indexable records; filled by the import tool, walked by
//!   the indexer

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{Connector, StatusStore};
use crate::domain::{StatusEvent, StatusLogEntry, StatusRecord};
use crate::error::{Error, Result};

/// Create the tables used by the status store and the indexer.
pub fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS import_status (
            lastimportdate TEXT,
            sequence_id INTEGER,
            indexed INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS import_osmosis_log (
            batchend TEXT,
            batchseq INTEGER,
            starttime TEXT NOT NULL,
            endtime TEXT NOT NULL,
            event TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS placex (
            place_id INTEGER PRIMARY KEY,
            osm_type TEXT NOT NULL,
            osm_id INTEGER NOT NULL,
            class TEXT NOT NULL,
            type TEXT NOT NULL,
            rank_search INTEGER NOT NULL DEFAULT 30,
            indexed_status INTEGER NOT NULL DEFAULT 1,
            indexed_date TEXT,
            osm_timestamp TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_placex_pending
            ON placex(rank_search) WHERE indexed_status > 0;
        "#,
    )?;

    Ok(())
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::StateParse(format!("invalid timestamp '{}' in store: {}", raw, e)))
}

fn parse_optional(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Opens connections to a SQLite store file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Set how long a connection waits on a locked database.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a raw connection with the schema in place.
    pub fn open(&self) -> Result<Connection> {
        let db = Connection::open(&self.path)?;
        db.busy_timeout(self.busy_timeout)?;
        let _mode: String = db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        init_schema(&db)?;
        Ok(db)
    }
}

impl Connector for SqliteConnector {
    type Store = SqliteStatusStore;

    fn connect(&self) -> Result<SqliteStatusStore> {
        Ok(SqliteStatusStore::new(self.open()?))
    }
}

/// Status store over one SQLite connection.
///
/// rusqlite::Connection isn't Sync, so the connection sits behind a Mutex;
/// status operations are short and need exclusive access anyway.
pub struct SqliteStatusStore {
    db: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStatusStore").finish_non_exhaustive()
    }
}

impl SqliteStatusStore {
    pub fn new(db: Connection) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| Error::Io(std::io::Error::other(format!("status store lock poisoned: {}", e))))
    }
}

impl StatusStore for SqliteStatusStore {
    fn get_status(&self) -> Result<StatusRecord> {
        let db = self.db()?;
        let row = db
            .query_row(
                "SELECT lastimportdate, sequence_id, indexed FROM import_status LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((date, seq, indexed)) => Ok(StatusRecord {
                batch_date: parse_optional(date)?,
                sequence_id: seq.and_then(|s| u64::try_from(s).ok()),
                indexed,
            }),
            None => Ok(StatusRecord::default()),
        }
    }

    fn set_status(&self, date: Option<DateTime<Utc>>, seq: Option<u64>, indexed: bool) -> Result<()> {
        let mut db = self.db()?;
        let seq = seq.map(|s| s as i64);

        match date {
            None => {
                db.execute(
                    "UPDATE import_status SET sequence_id = ?1, indexed = ?2",
                    params![seq, indexed],
                )?;
            }
            Some(date) => {
                let tx = db.transaction()?;
                tx.execute("DELETE FROM import_status", [])?;
                tx.execute(
                    "INSERT INTO import_status (lastimportdate, sequence_id, indexed) VALUES (?1, ?2, ?3)",
                    params![format_timestamp(&date), seq, indexed],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    fn set_indexed(&self, indexed: bool) -> Result<()> {
        self.db()?
            .execute("UPDATE import_status SET indexed = ?1", params![indexed])?;
        Ok(())
    }

    fn log_status(&self, start: DateTime<Utc>, event: StatusEvent) -> Result<()> {
        self.db()?.execute(
            r#"
            INSERT INTO import_osmosis_log (batchend, batchseq, starttime, endtime, event)
            SELECT lastimportdate, sequence_id, ?1, ?2, ?3 FROM import_status
            "#,
            params![format_timestamp(&start), format_timestamp(&Utc::now()), event.as_str()],
        )?;
        Ok(())
    }

    fn database_date(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .db()?
            .query_row("SELECT max(osm_timestamp) FROM placex", [], |row| row.get(0))?;
        parse_optional(raw)
    }

    fn status_log(&self) -> Result<Vec<StatusLogEntry>> {
        let db = self.db()?;
        let mut stmt = db.prepare(
            "SELECT batchend, batchseq, starttime, endtime, event FROM import_osmosis_log ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (batch_end, batch_seq, start, end, event) = row?;
            entries.push(StatusLogEntry {
                batch_end: parse_optional(batch_end)?,
                batch_seq: batch_seq.and_then(|s| u64::try_from(s).ok()),
                start_time: parse_timestamp(&start)?,
                end_time: parse_timestamp(&end)?,
                event,
            });
        }

        Ok(entries)
    }
}
