//! Advisory locks for run and application state.
//!
//! The controller serializes all mutations of a job's durable state through
//! hierarchical advisory locks: one lock per (application, job type), one
//! per (application, job type, step), and one per application record. Locks
//! are in-process, fair (waiters queue FIFO) and released when their guard
//! drops.
//!
//! Guards are task-scoped and never re-entered: each controller operation
//! acquires a given key at most once, and inner helpers receive the held
//! guard instead of re-locking. Where both a step lock and the type lock
//! are needed, step locks are taken first.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use larch_deploy_core::ApplicationId;
use larch_deploy_core::JobType;
use larch_deploy_core::Step;
use larch_deploy_core::TenantAndApplicationId;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::JobError;
use crate::error::Result;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock key for all runs of a job.
pub fn job_key(application: &ApplicationId, job_type: &JobType) -> String {
    format!("/locks/runs/{application}/{}", job_type.job_name())
}

/// Lock key for one step of a job's active run.
pub fn step_key(application: &ApplicationId, job_type: &JobType, step: Step) -> String {
    format!("/locks/runs/{application}/{}/{}", job_type.job_name(), step.name())
}

/// Lock key for an application record.
pub fn application_key(id: &TenantAndApplicationId) -> String {
    format!("/locks/applications/{id}")
}

/// Registry of named advisory locks.
pub struct LockService {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

impl Default for LockService {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockService {
    /// A lock service with the default acquisition bound.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A lock service with the given default acquisition bound.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock for `key`, waiting at most the default bound.
    pub async fn lock(&self, key: String) -> Result<LockGuard> {
        self.lock_with_timeout(key, self.timeout).await
    }

    /// Acquire the lock for `key`, waiting at most `timeout`.
    pub async fn lock_with_timeout(&self, key: String, timeout: Duration) -> Result<LockGuard> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock registry poisoned");
            Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard { key, _guard: guard }),
            Err(_) => Err(JobError::Timeout {
                what: key,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Exclusive hold of one advisory lock; released on drop.
pub struct LockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Proof of exclusive permission to mutate one step of a run.
///
/// Created only by `JobController::lock_step`, which also verifies that no
/// prerequisite of the step is being executed. Step reporting APIs take a
/// reference to this token.
#[derive(Debug)]
pub struct LockedStep {
    step: Step,
    _guard: LockGuard,
}

impl LockedStep {
    pub(crate) fn new(step: Step, guard: LockGuard) -> Self {
        Self { step, _guard: guard }
    }

    /// The step this token grants access to.
    pub fn step(&self) -> Step {
        self.step
    }
}
