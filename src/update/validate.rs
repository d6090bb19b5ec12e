//! Configuration checks run once before the update loop starts.

use std::time::Duration;

use crate::domain::{LoopOptions, LoopParameters};
use crate::error::{Error, Result};

/// Replication hosts that enforce a minimum update interval.
pub const RATE_LIMITED_HOSTS: &[(&str, Duration)] = &[("download.geofabrik.de", Duration::from_secs(86400))];

/// Minimum update interval required by the host of `base_url`, if any.
pub fn minimum_interval(base_url: &str) -> Option<Duration> {
    RATE_LIMITED_HOSTS
        .iter()
        .find(|(host, _)| base_url.contains(host))
        .map(|(_, min)| *min)
}

/// Reject configurations the loop must not run with.
///
/// Checked before any request is sent to the replication service.
pub fn validate(params: &LoopParameters, options: &LoopOptions) -> Result<()> {
    let too_frequent = minimum_interval(&params.base_url).filter(|min| params.update_interval < *min);
    if let Some(min) = too_frequent {
        log::error!(
            "Update interval too low for {}: {}s configured, at least {}s required.\n\
             Please set replication.update_interval_secs accordingly.",
            params.base_url,
            params.update_interval.as_secs(),
            min.as_secs()
        );
        return Err(Error::Usage("Invalid replication update interval setting.".to_string()));
    }

    if !options.once && !options.do_index {
        log::error!("Indexing cannot be disabled when running updates continuously.");
        return Err(Error::Usage("Bad argument '--no-index'.".to_string()));
    }

    Ok(())
}
