//! Error types for georepl
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while replicating updates
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or command usage; never retried
    #[error("Usage error: {0}")]
    Usage(String),

    /// Store (SQLite) error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Download from the replication service failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A replication state file could not be parsed
    #[error("Invalid replication state: {0}")]
    StateParse(String),

    /// The import tool failed to apply a diff
    #[error("Import error: {0}")]
    Import(String),

    /// Indexing failed
    #[error("Index error: {0}")]
    Index(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is likely transient (network trouble).
    ///
    /// The update loop never retries on its own; this only drives the
    /// guidance printed when the process gives up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether this is a usage error the user has to fix.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }
}

/// Result type alias for georepl operations
pub type Result<T> = std::result::Result<T, Error>;
