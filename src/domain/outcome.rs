//! Update outcome types.
//!
//! This module defines the result of a single apply attempt and the exit code
//! each result maps to.

use std::fmt;

/// Outcome of one attempt to fetch and apply the next batch of changes.
///
/// The numeric code is the process exit code in update mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOutcome {
    /// Diffs were applied and the store is as current as this batch allows
    UpToDate,
    /// Nothing was fetched because previously applied data still needs indexing
    MorePending,
    /// No new diffs were available
    NoChanges,
}

impl UpdateOutcome {
    /// Exit code reported for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            UpdateOutcome::UpToDate => 0,
            UpdateOutcome::MorePending => 2,
            UpdateOutcome::NoChanges => 3,
        }
    }

    /// True for every outcome that should be followed by indexing.
    pub fn is_changed(self) -> bool {
        self != UpdateOutcome::NoChanges
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::UpToDate => "up-to-date",
            UpdateOutcome::MorePending => "more-pending",
            UpdateOutcome::NoChanges => "no-changes",
        }
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
