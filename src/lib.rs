//! georepl - keeps a geospatial database current from an online replication
//! service.
//!
//! The update loop repeatedly downloads the next batch of change files,
//! applies them with an external import tool, indexes the affected records
//! rank by rank and records its progress in the store.

pub mod domain;
pub mod error;
pub mod indexer;
pub mod replication;
pub mod store;
pub mod update;

pub use error::{Error, Result};
