//! Rank runner - indexes the pending records of one rank with a worker pool.
//!
//! Pending ids are split into contiguous slices, one per worker. Each worker
//! opens its own connection and commits in batches. The call returns only
//! after every worker finished, so a rank is complete before the next starts.

use std::thread;

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::store::{SqliteConnector, format_timestamp};

/// Which records of a rank get indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Administrative boundaries only
    Boundaries,
    /// Every pending record
    Rank,
}

impl Phase {
    fn pending_query(self) -> &'static str {
        match self {
            Phase::Boundaries => {
                "SELECT place_id FROM placex
                 WHERE indexed_status > 0 AND rank_search = ?1
                   AND class = 'boundary' AND type = 'administrative'
                 ORDER BY place_id"
            }
            Phase::Rank => {
                "SELECT place_id FROM placex
                 WHERE indexed_status > 0 AND rank_search = ?1
                 ORDER BY place_id"
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Boundaries => "boundaries",
            Phase::Rank => "rank",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankRunner {
    connector: SqliteConnector,
    threads: usize,
    batch_size: usize,
}

impl RankRunner {
    pub fn new(connector: SqliteConnector, threads: usize, batch_size: usize) -> Self {
        Self {
            connector,
            threads: threads.max(1),
            batch_size: batch_size.max(1),
        }
    }

    fn pending(&self, phase: Phase, rank: u8) -> Result<Vec<i64>> {
        let db = self.connector.open()?;
        let mut stmt = db.prepare(phase.pending_query())?;
        let ids = stmt
            .query_map(params![rank], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn index_slice(&self, ids: &[i64]) -> Result<usize> {
        let mut db = self.connector.open()?;
        let now = format_timestamp(&Utc::now());

        for batch in ids.chunks(self.batch_size) {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt =
                    tx.prepare_cached("UPDATE placex SET indexed_status = 0, indexed_date = ?1 WHERE place_id = ?2")?;
                for id in batch {
                    stmt.execute(params![now, id])?;
                }
            }
            tx.commit()?;
        }

        Ok(ids.len())
    }

    /// Index every pending record of `rank`. Returns the number indexed.
    pub fn run(&self, phase: Phase, rank: u8) -> Result<usize> {
        let started = Utc::now();
        let ids = self.pending(phase, rank)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let per_worker = ids.len().div_ceil(self.threads);
        let results: Vec<Result<usize>> = thread::scope(|scope| {
            let handles: Vec<_> = ids
                .chunks(per_worker)
                .map(|slice| scope.spawn(move || self.index_slice(slice)))
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::Index(format!("{} worker for rank {} panicked", phase.as_str(), rank)))
                    })
                })
                .collect()
        });

        let mut done = 0;
        for result in results {
            done += result?;
        }

        let elapsed = Utc::now().signed_duration_since(started);
        log::info!(
            "Done {} {} places at rank {} in {}s",
            done,
            phase.as_str(),
            rank,
            elapsed.num_seconds()
        );
        Ok(done)
    }
}
