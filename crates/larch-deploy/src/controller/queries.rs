//! Read-only queries over runs, history and logs.
//!
//! Queries return consistent snapshots of the last-read store state and do
//! not lock, with the exception of [`JobController::details`], which takes
//! the type lock to route between the active buffer and the sealed log.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use larch_core::KeyValueStore;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::JobId;
use larch_deploy_core::JobType;
use larch_deploy_core::Run;
use larch_deploy_core::RunId;
use larch_deploy_core::RunLog;
use larch_deploy_core::TenantAndApplicationId;

use super::JobController;
use crate::error::Result;
use crate::lock;
use crate::status::DeploymentStatus;
use crate::status::JobStatus;

impl<S: KeyValueStore + ?Sized> JobController<S> {
    /// All known runs of the job, by number: history plus the last run.
    pub async fn runs(&self, application: &ApplicationId, job_type: &JobType) -> Result<BTreeMap<u64, Run>> {
        let mut runs = self.runs.read_historic_runs(application, job_type).await?;
        if let Some(last) = self.runs.read_last_run(application, job_type).await? {
            runs.insert(last.id.number, last);
        }
        Ok(runs)
    }

    /// The run with the given id, if it exists.
    pub async fn run(&self, id: &RunId) -> Result<Option<Run>> {
        Ok(self.runs(&id.application, &id.job_type).await?.remove(&id.number))
    }

    /// The most recent run of the job, ended or not.
    pub async fn last(&self, application: &ApplicationId, job_type: &JobType) -> Result<Option<Run>> {
        self.runs.read_last_run(application, job_type).await
    }

    /// The run with the given id, provided it is still active.
    pub async fn active(&self, id: &RunId) -> Result<Option<Run>> {
        Ok(self
            .last(&id.application, &id.job_type)
            .await?
            .filter(|run| !run.has_ended() && run.id == *id))
    }

    /// All active runs across registered applications.
    pub async fn active_runs(&self) -> Result<Vec<Run>> {
        let mut active = Vec::new();
        for application in self.instances().await? {
            active.extend(self.active_for_application(&application).await?);
        }
        Ok(active)
    }

    /// All active runs of one application instance.
    pub async fn active_for_application(&self, application: &ApplicationId) -> Result<Vec<Run>> {
        let mut active = Vec::new();
        for job_type in self.runs.job_types(application).await? {
            if let Some(run) = self.last(application, &job_type).await? {
                if !run.has_ended() {
                    active.push(run);
                }
            }
        }
        Ok(active)
    }

    /// Snapshot status of one job.
    pub async fn job_status(&self, id: &JobId) -> Result<JobStatus> {
        Ok(JobStatus::new(id.clone(), self.runs(&id.application, &id.job_type).await?))
    }

    /// The most recent completed run of the job.
    pub async fn last_completed(&self, id: &JobId) -> Result<Option<Run>> {
        Ok(self.job_status(id).await?.last_completed().cloned())
    }

    /// The most recent successful run of the job.
    pub async fn last_success(&self, id: &JobId) -> Result<Option<Run>> {
        Ok(self.job_status(id).await?.last_success().cloned())
    }

    /// The first run that failed after the job's last success.
    pub async fn first_failing(&self, id: &JobId) -> Result<Option<Run>> {
        Ok(self.job_status(id).await?.first_failing().cloned())
    }

    /// Start times of the job's non-redeployment runs, newest first.
    pub async fn job_starts(&self, id: &JobId) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .runs(&id.application, &id.job_type)
            .await?
            .values()
            .rev()
            .filter(|run| !run.is_redeployment)
            .map(|run| run.start)
            .collect())
    }

    /// All registered application instances.
    pub async fn instances(&self) -> Result<Vec<ApplicationId>> {
        self.applications.instances().await
    }

    /// The job types which have been run for the application.
    pub async fn jobs(&self, application: &ApplicationId) -> Result<Vec<JobType>> {
        let mut jobs = Vec::new();
        for job_type in self.runs.job_types(application).await? {
            if self.last(application, &job_type).await?.is_some() {
                jobs.push(job_type);
            }
        }
        Ok(jobs)
    }

    /// Deployment status of one application, across its instances.
    pub async fn deployment_status(&self, id: &TenantAndApplicationId) -> Result<DeploymentStatus> {
        let mut jobs = Vec::new();
        if let Some(record) = self.applications.read(id).await? {
            for name in record.instances.keys() {
                let instance = id.instance(name.as_str());
                for job_type in self.jobs(&instance).await? {
                    jobs.push(self.job_status(&JobId::new(instance.clone(), job_type)).await?);
                }
            }
        }
        Ok(DeploymentStatus {
            application: id.clone(),
            system_version: self.services.version_status.deployable_versions().last().copied(),
            at: self.now(),
            jobs,
        })
    }

    /// Deployment status of each of the given applications.
    pub async fn deployment_statuses(&self, ids: &[TenantAndApplicationId]) -> Result<Vec<DeploymentStatus>> {
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(self.deployment_status(id).await?);
        }
        Ok(statuses)
    }

    /// The log entries of the run with id greater than `after`, routed to
    /// the active buffer or the sealed log; `None` for an unknown run.
    pub async fn details(&self, id: &RunId, after: u64) -> Result<Option<RunLog>> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        if self.run(id).await?.is_none() {
            return Ok(None);
        }
        if self.active(id).await?.is_some() {
            Ok(Some(self.logs.read_active(&id.application, &id.job_type, after).await?))
        } else {
            self.logs.read_finished(id, after).await
        }
    }

    /// The run's test reports as a JSON array, if any were stored.
    pub async fn read_test_reports(&self, id: &RunId) -> Result<Option<String>> {
        self.logs.read_test_reports(id).await
    }
}
