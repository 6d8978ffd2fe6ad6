//! Run log entries and test reports.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::step::Step;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// Diagnostic output.
    Debug,
    /// Normal progress output.
    Info,
    /// Something unexpected, run continues.
    Warning,
    /// Something went wrong.
    Error,
}

/// One log line of a run.
///
/// Ids are assigned by the log store when entries are appended, and are
/// strictly increasing within a run; entries from collaborators carry the
/// collaborator's own ids until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Id of this entry within its run.
    pub id: u64,
    /// When the logged event happened.
    pub at: DateTime<Utc>,
    /// Severity.
    #[serde(rename = "type")]
    pub entry_type: LogType,
    /// The logged message.
    pub message: String,
}

impl LogEntry {
    /// An entry pending id assignment by the log store.
    pub fn new(at: DateTime<Utc>, entry_type: LogType, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            at,
            entry_type,
            message: message.into(),
        }
    }
}

/// The log of one run: entries per step, in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    /// Entries grouped by the step they were logged under.
    pub entries: BTreeMap<Step, Vec<LogEntry>>,
    /// Id of the last entry included, for continuation; `None` when empty.
    pub last_id: Option<u64>,
}

impl RunLog {
    /// A log with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total number of entries across all steps.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True when no step has any entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An opaque test report produced by the tester for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestReport(pub serde_json::Value);

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn run_log_counts_entries_across_steps() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut log = RunLog::empty();
        assert!(log.is_empty());
        log.entries
            .entry(Step::DeployReal)
            .or_default()
            .push(LogEntry::new(at, LogType::Info, "deploying"));
        log.entries
            .entry(Step::EndTests)
            .or_default()
            .extend([LogEntry::new(at, LogType::Info, "ok"), LogEntry::new(at, LogType::Error, "bad")]);
        assert_eq!(log.len(), 3);
    }
}
