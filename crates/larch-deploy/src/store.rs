//! Durable run storage over the key-value store.
//!
//! Key schema:
//!
//! ```text
//! /runs/{tenant}.{application}.{instance}/{job-name}/last     active slot
//! /runs/{tenant}.{application}.{instance}/{job-name}/history  number -> run
//! ```
//!
//! The active slot holds the most recent run, ended or not; the history map
//! holds finalized runs only. Values are JSON. Reads of a key see the last
//! committed write to that key; callers serialize read-modify-write cycles
//! through the job's type lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use larch_core::KeyValueStore;
use larch_core::ReadRequest;
use larch_core::ScanRequest;
use larch_core::WriteRequest;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::JobType;
use larch_deploy_core::Run;
use tracing::warn;

use crate::error::JobError;
use crate::error::Result;

/// Key prefix for run data.
const KV_PREFIX_RUNS: &str = "/runs/";

fn job_prefix(application: &ApplicationId, job_type: &JobType) -> String {
    format!("{KV_PREFIX_RUNS}{application}/{}/", job_type.job_name())
}

fn last_run_key(application: &ApplicationId, job_type: &JobType) -> String {
    format!("{}last", job_prefix(application, job_type))
}

fn history_key(application: &ApplicationId, job_type: &JobType) -> String {
    format!("{}history", job_prefix(application, job_type))
}

/// Run persistence for the controller.
pub struct RunStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> RunStore<S> {
    /// A run store over the given key-value store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The most recent run of the job, ended or not.
    pub async fn read_last_run(&self, application: &ApplicationId, job_type: &JobType) -> Result<Option<Run>> {
        let key = last_run_key(application, job_type);
        let result = self.store.read(ReadRequest::new(key.clone())).await?;
        match result.kv {
            None => Ok(None),
            Some(kv) => serde_json::from_str(&kv.value).map(Some).map_err(|e| JobError::Storage {
                message: format!("corrupt run at {key}: {e}"),
            }),
        }
    }

    /// Overwrite the active slot of the run's job.
    pub async fn write_last_run(&self, run: &Run) -> Result<()> {
        let key = last_run_key(&run.id.application, &run.id.job_type);
        let value = serde_json::to_string(run).map_err(|e| JobError::Storage {
            message: format!("failed to serialize {}: {e}", run.id),
        })?;
        self.store.write(WriteRequest::set(key, value)).await?;
        Ok(())
    }

    /// The finalized runs of the job, sorted by number.
    pub async fn read_historic_runs(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
    ) -> Result<BTreeMap<u64, Run>> {
        let key = history_key(application, job_type);
        let result = self.store.read(ReadRequest::new(key.clone())).await?;
        match result.kv {
            None => Ok(BTreeMap::new()),
            Some(kv) => serde_json::from_str(&kv.value).map_err(|e| JobError::Storage {
                message: format!("corrupt history at {key}: {e}"),
            }),
        }
    }

    /// Replace the history map of the job in one write.
    pub async fn write_historic_runs(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        runs: &BTreeMap<u64, Run>,
    ) -> Result<()> {
        let key = history_key(application, job_type);
        let value = serde_json::to_string(runs).map_err(|e| JobError::Storage {
            message: format!("failed to serialize history at {key}: {e}"),
        })?;
        self.store.write(WriteRequest::set(key, value)).await?;
        Ok(())
    }

    /// Applications with any stored run data, from the key schema.
    pub async fn applications_with_jobs(&self) -> Result<Vec<ApplicationId>> {
        let result = self.store.scan(ScanRequest::prefix(KV_PREFIX_RUNS)).await?;
        let mut applications = BTreeSet::new();
        for entry in result.entries {
            let remainder = &entry.key[KV_PREFIX_RUNS.len()..];
            let Some(segment) = remainder.split('/').next() else {
                continue;
            };
            match segment.parse::<ApplicationId>() {
                Ok(id) => {
                    applications.insert(id);
                }
                Err(_) => warn!(key = %entry.key, "skipping run key with unparseable application id"),
            }
        }
        Ok(applications.into_iter().collect())
    }

    /// Job types with any stored run data for the application.
    pub async fn job_types(&self, application: &ApplicationId) -> Result<Vec<JobType>> {
        let prefix = format!("{KV_PREFIX_RUNS}{application}/");
        let result = self.store.scan(ScanRequest::prefix(prefix.clone())).await?;
        let mut types = BTreeSet::new();
        for entry in result.entries {
            let remainder = &entry.key[prefix.len()..];
            let Some(segment) = remainder.split('/').next() else {
                continue;
            };
            match JobType::from_job_name(segment) {
                Some(job_type) => {
                    types.insert(job_type);
                }
                None => warn!(key = %entry.key, "skipping run key with unknown job name"),
            }
        }
        Ok(types.into_iter().collect())
    }

    /// Remove the active slot and history of one job.
    pub async fn delete_run_data_for_type(&self, application: &ApplicationId, job_type: &JobType) -> Result<()> {
        let keys = vec![last_run_key(application, job_type), history_key(application, job_type)];
        self.store.write(WriteRequest::delete_multi(keys)).await?;
        Ok(())
    }

    /// Remove every run key of the application.
    pub async fn delete_run_data(&self, application: &ApplicationId) -> Result<()> {
        let prefix = format!("{KV_PREFIX_RUNS}{application}/");
        let result = self.store.scan(ScanRequest::prefix(prefix)).await?;
        if result.entries.is_empty() {
            return Ok(());
        }
        let keys = result.entries.into_iter().map(|kv| kv.key).collect();
        self.store.write(WriteRequest::delete_multi(keys)).await?;
        Ok(())
    }
}
