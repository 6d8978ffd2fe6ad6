//! Error types for the deployment job controller.
//!
//! The taxonomy is deliberately small: callers branch on the kind to decide
//! whether to retry (`Timeout`, `Storage`), back off and replace
//! (`Conflict`), or give up (`Invalid`, `NotFound`). Collaborator failures
//! surface as `External` unless the operation's contract says to swallow
//! them and continue.

use larch_deploy_core::RunError;
use snafu::Snafu;

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// Errors surfaced by the deployment job controller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JobError {
    /// Arguments fail the operation's contract. No state was changed.
    #[snafu(display("invalid request: {reason}"))]
    Invalid {
        /// Why the arguments were rejected.
        reason: String,
    },

    /// The action would violate the single-active-run invariant.
    #[snafu(display("conflict: {reason}"))]
    Conflict {
        /// What conflicted.
        reason: String,
    },

    /// A lock could not be acquired within its bound. Transient.
    #[snafu(display("timed out acquiring {what} after {timeout_ms} ms"))]
    Timeout {
        /// The lock or resource that was contended.
        what: String,
        /// The bound that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// A referenced run or application does not exist.
    #[snafu(display("not found: {what}"))]
    NotFound {
        /// What was missing.
        what: String,
    },

    /// The underlying store failed or returned corrupt data. Transient.
    #[snafu(display("storage failure: {message}"))]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// A collaborator call failed.
    #[snafu(display("{service} call failed: {message}"))]
    External {
        /// The collaborator that failed.
        service: String,
        /// Description of the failure.
        message: String,
    },
}

impl From<larch_core::KeyValueStoreError> for JobError {
    fn from(source: larch_core::KeyValueStoreError) -> Self {
        JobError::Storage {
            message: source.to_string(),
        }
    }
}

impl From<RunError> for JobError {
    fn from(source: RunError) -> Self {
        JobError::Invalid {
            reason: source.to_string(),
        }
    }
}
