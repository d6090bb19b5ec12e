//! Indexer module - walks un-indexed records in rank order.
//!
//! Ranks encode dependencies between record types: a record can only be
//! indexed once everything of a lower rank it may depend on is done. Both
//! phases therefore process ranks strictly one after another; parallelism
//! only happens inside a rank.

mod runner;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::SqliteConnector;

pub use runner::{Phase, RankRunner};

/// Lowest rank carrying administrative boundaries
const MIN_BOUNDARY_RANK: u8 = 4;
/// Boundaries at this rank and above are indexed with the ranked phase
const MAX_BOUNDARY_RANK: u8 = 26;
/// Highest search rank
pub const MAX_RANK: u8 = 30;

/// Indexes pending records.
#[async_trait]
pub trait IndexEngine: Send + Sync {
    /// Index administrative boundaries across the rank range.
    async fn index_boundaries(&self, min_rank: u8, max_rank: u8) -> Result<usize>;

    /// Index all remaining records by ascending rank.
    async fn index_by_rank(&self, min_rank: u8, max_rank: u8) -> Result<usize>;
}

/// Ranks visited by the boundaries phase.
pub fn boundary_ranks(min_rank: u8, max_rank: u8) -> Vec<u8> {
    (min_rank.max(MIN_BOUNDARY_RANK)..max_rank.min(MAX_BOUNDARY_RANK)).collect()
}

/// Ranks visited by the ranked phase, in processing order. Rank 0 (records
/// without a proper rank) comes last when the range reaches the top rank.
pub fn rank_order(min_rank: u8, max_rank: u8) -> Vec<u8> {
    let upper = max_rank.min(MAX_RANK);
    let mut ranks: Vec<u8> = (min_rank.max(1)..=upper).collect();
    if upper == MAX_RANK {
        ranks.push(0);
    }
    ranks
}

/// Indexer over a SQLite store.
#[derive(Debug, Clone)]
pub struct Indexer {
    runner: RankRunner,
    threads: usize,
}

impl Indexer {
    pub fn new(connector: SqliteConnector, threads: usize) -> Self {
        Self::with_batch_size(connector, threads, 1000)
    }

    pub fn with_batch_size(connector: SqliteConnector, threads: usize, batch_size: usize) -> Self {
        Self {
            runner: RankRunner::new(connector, threads, batch_size),
            threads: threads.max(1),
        }
    }

    /// Run `phase` over `ranks` on a blocking thread.
    async fn run_phase(&self, phase: Phase, ranks: Vec<u8>) -> Result<usize> {
        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || {
            let mut total = 0;
            for rank in ranks {
                total += runner.run(phase, rank)?;
            }
            Ok::<usize, Error>(total)
        })
        .await
        .map_err(|e| Error::Index(format!("{} indexing task failed: {}", phase.as_str(), e)))?
    }
}

#[async_trait]
impl IndexEngine for Indexer {
    async fn index_boundaries(&self, min_rank: u8, max_rank: u8) -> Result<usize> {
        log::info!(
            "Starting indexing boundaries using {} threads",
            self.threads
        );
        let done = self.run_phase(Phase::Boundaries, boundary_ranks(min_rank, max_rank)).await?;
        log::info!("Indexed {} boundaries", done);
        Ok(done)
    }

    async fn index_by_rank(&self, min_rank: u8, max_rank: u8) -> Result<usize> {
        log::info!(
            "Starting indexing rank ({} to {}) using {} threads",
            min_rank,
            max_rank.min(MAX_RANK),
            self.threads
        );
        let done = self.run_phase(Phase::Rank, rank_order(min_rank, max_rank)).await?;
        log::info!("Indexed {} places", done);
        Ok(done)
    }
}
