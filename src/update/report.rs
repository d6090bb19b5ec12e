//! Progress report emitted after each iteration.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Loop-local timestamps of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub loop_start: DateTime<Utc>,
    /// Set only when indexing ran
    pub index_start: Option<DateTime<Utc>>,
    /// Batch timestamp read back from the store after the apply step
    pub batch_date: Option<DateTime<Utc>>,
}

impl Timings {
    pub fn report(&self, now: DateTime<Utc>) -> UpdateReport {
        UpdateReport::new(self.loop_start, self.index_start, self.batch_date, now)
    }
}

/// Durations of one iteration, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub import: Duration,
    pub index: Option<Duration>,
    pub total: Duration,
    /// How far the store lags behind the replication service
    pub backlog: Option<Duration>,
}

/// Whole seconds between two instants, zero if `to` is before `from`.
fn whole_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    Duration::from_secs(to.signed_duration_since(from).num_seconds().max(0) as u64)
}

impl UpdateReport {
    pub fn new(
        loop_start: DateTime<Utc>,
        index_start: Option<DateTime<Utc>>,
        batch_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            import: whole_seconds(loop_start, index_start.unwrap_or(now)),
            index: index_start.map(|start| whole_seconds(start, now)),
            total: whole_seconds(loop_start, now),
            backlog: batch_date.map(|date| whole_seconds(date, now)),
        }
    }
}

/// Format as `H:MM:SS`, prefixed with `N day(s), ` past 24 hours.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let days = secs / 86400;
    let rest = secs % 86400;
    let hms = format!("{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    match days {
        0 => hms,
        1 => format!("1 day, {}", hms),
        n => format!("{} days, {}", n, hms),
    }
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Update completed. Import: {}. ", format_duration(self.import))?;
        if let Some(index) = self.index {
            write!(f, "Indexing: {} ", format_duration(index))?;
        }
        write!(f, "Total: {}. ", format_duration(self.total))?;
        match self.backlog {
            Some(backlog) => write!(f, "Remaining backlog: {}.", format_duration(backlog)),
            None => write!(f, "Remaining backlog: unknown."),
        }
    }
}
