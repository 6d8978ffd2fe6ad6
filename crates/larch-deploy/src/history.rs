//! Retention policy for historic runs.
//!
//! After a run is finalized the history of its job must satisfy the length
//! bound and the age bound, with one exception: the latest success and the
//! first failing run after it are always kept, so the last known-good state
//! and the regression that followed it stay diagnosable however old they
//! are.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use larch_deploy_core::Run;
use larch_deploy_core::RunStatus;

/// Number of the latest successful run in the history, if any.
pub fn latest_success(history: &BTreeMap<u64, Run>) -> Option<u64> {
    history
        .iter()
        .rev()
        .find(|(_, run)| run.status == RunStatus::Success)
        .map(|(number, _)| *number)
}

/// Number of the first failing run after the given success; with no success
/// given, the first failing run overall.
pub fn first_failing_after(history: &BTreeMap<u64, Run>, success: Option<u64>) -> Option<u64> {
    history
        .iter()
        .filter(|(number, _)| success.map_or(true, |s| **number > s))
        .find(|(_, run)| run.status.is_failure())
        .map(|(number, _)| *number)
}

/// The run numbers to evict from the history, oldest first.
///
/// A run is evicted while it violates the length bound (its number is at
/// least `history_length` behind the newest) or the age bound, unless it is
/// protected: the latest success, or the first failing run after it.
/// Bounds are monotone in run number, so the walk stops at the first entry
/// violating neither.
pub fn runs_to_evict(
    history: &BTreeMap<u64, Run>,
    history_length: usize,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<u64> {
    let Some(last) = history.keys().next_back().copied() else {
        return Vec::new();
    };
    let oldest_start = now - max_age;
    let protected_success = latest_success(history);
    let protected_failure = first_failing_after(history, protected_success);

    let mut evict = Vec::new();
    for (number, run) in history {
        let beyond_length = *number + history_length as u64 <= last;
        let beyond_age = run.start < oldest_start;
        if !beyond_length && !beyond_age {
            break;
        }
        if Some(*number) == protected_success || Some(*number) == protected_failure {
            continue;
        }
        evict.push(*number);
    }
    evict
}
