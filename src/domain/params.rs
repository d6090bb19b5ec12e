//! Loop configuration assembled once before the update loop starts.

use std::path::PathBuf;
use std::time::Duration;

/// Immutable parameters shared by every iteration of the update loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopParameters {
    /// Path of the SQLite store; a fresh connection is opened from it per step
    pub dsn: PathBuf,
    pub import_tool: PathBuf,
    /// Import tool cache size in MB
    pub import_cache_mb: u32,
    pub import_style: Option<PathBuf>,
    pub flatnode_file: Option<PathBuf>,
    /// Worker threads for importing and indexing
    pub threads: usize,
    pub base_url: String,
    /// Minimum age of the last batch before new diffs are fetched
    pub update_interval: Duration,
    /// Upper bound on diff data fetched per apply, in MB
    pub max_diff_size_mb: u64,
    /// Where downloaded diffs are staged for the import tool
    pub import_file: PathBuf,
    /// Skip fetching while applied data is still waiting to be indexed
    pub indexed_only: bool,
    /// Timeout applied to every request against the replication service
    pub socket_timeout: Duration,
}

impl LoopParameters {
    /// Maximum diff size in bytes.
    pub fn max_diff_bytes(&self) -> u64 {
        self.max_diff_size_mb.saturating_mul(1024 * 1024)
    }
}

/// How the update loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Stop after a single iteration
    pub once: bool,
    /// Index applied data after each changed iteration
    pub do_index: bool,
    /// Sleep between iterations that found nothing new
    pub recheck_interval: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            once: false,
            do_index: true,
            recheck_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_params() -> LoopParameters {
    LoopParameters {
        dsn: PathBuf::from("test.db"),
        import_tool: PathBuf::from("osm2pgsql"),
        import_cache_mb: 2000,
        import_style: None,
        flatnode_file: None,
        threads: 1,
        base_url: "https://planet.openstreetmap.org/replication/minute".to_string(),
        update_interval: Duration::from_secs(75),
        max_diff_size_mb: 50,
        import_file: PathBuf::from("osmosischange.osc"),
        indexed_only: true,
        socket_timeout: Duration::from_secs(60),
    }
}
