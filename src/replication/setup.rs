//! One-time initialisation and the check-only query.

use chrono::TimeDelta;

use super::source::{ReplicationSource, timestamp_to_sequence};
use crate::error::{Error, Result};
use crate::store::StatusStore;

/// Safety margin subtracted from the database date when picking the first
/// sequence, so no change is missed
const INIT_MARGIN_HOURS: i64 = 3;

/// Result of [`check_for_updates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The service has diffs newer than the store
    UpdatesAvailable { current: u64, available: u64 },
    /// The store is at the newest published sequence
    UpToDate,
    /// The replication service state could not be fetched
    ServerUnavailable,
    /// Replication was never initialised for this store
    NotInitialised,
}

impl CheckResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckResult::UpdatesAvailable { .. } => 0,
            CheckResult::UpToDate => 2,
            CheckResult::ServerUnavailable => 253,
            CheckResult::NotInitialised => 254,
        }
    }
}

/// Point the store at the replication sequence matching its data.
///
/// Returns the chosen sequence number.
pub async fn init_replication<St, S>(store: &St, source: &S) -> Result<u64>
where
    St: StatusStore,
    S: ReplicationSource,
{
    let Some(date) = store.database_date()? else {
        log::error!("Cannot determine the date of the data. Is the database empty?");
        return Err(Error::Usage("No data in the database.".to_string()));
    };
    log::info!("Database date is {}", date);

    let start = date - TimeDelta::hours(INIT_MARGIN_HOURS);
    let Some(seq) = timestamp_to_sequence(source, start).await? else {
        log::error!("Cannot reach the replication service to look up the start sequence.");
        return Err(Error::Usage("Replication service not reachable.".to_string()));
    };

    log::info!("Updates will start at sequence {} ({})", seq, start);
    store.set_status(Some(date), Some(seq), true)?;
    Ok(seq)
}

/// Compare the store's replication position with the service.
pub async fn check_for_updates<St, S>(store: &St, source: &S) -> Result<CheckResult>
where
    St: StatusStore,
    S: ReplicationSource,
{
    let status = store.get_status()?;
    let Some(current) = status.sequence_id else {
        log::error!("Replication not set up. Please run 'georepl init'.");
        return Ok(CheckResult::NotInitialised);
    };

    let Some(state) = source.get_state(None).await? else {
        log::error!("Cannot get state of the replication service.");
        return Ok(CheckResult::ServerUnavailable);
    };

    if state.sequence <= current {
        log::info!("Database is up to date.");
        return Ok(CheckResult::UpToDate);
    }

    log::info!("New data available ({} => {}).", current, state.sequence);
    Ok(CheckResult::UpdatesAvailable {
        current,
        available: state.sequence,
    })
}
