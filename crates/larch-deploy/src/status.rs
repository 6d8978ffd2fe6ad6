//! Read-only status views over a job's runs.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use larch_deploy_core::JobId;
use larch_deploy_core::Run;
use larch_deploy_core::RunStatus;
use larch_deploy_core::TenantAndApplicationId;
use larch_deploy_core::Version;

use crate::history;

/// Snapshot of all known runs of one job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// The job.
    pub id: JobId,
    /// All known runs, by number: history plus the last run.
    pub runs: BTreeMap<u64, Run>,
}

impl JobStatus {
    /// Build a status view from a runs snapshot.
    pub fn new(id: JobId, runs: BTreeMap<u64, Run>) -> Self {
        Self { id, runs }
    }

    /// The most recent run, ended or not.
    pub fn last(&self) -> Option<&Run> {
        self.runs.values().next_back()
    }

    /// Whether a run of this job is currently active.
    pub fn is_running(&self) -> bool {
        self.last().is_some_and(|run| !run.has_ended())
    }

    /// The most recent completed run.
    pub fn last_completed(&self) -> Option<&Run> {
        self.runs.values().rev().find(|run| run.has_ended())
    }

    /// The most recent successful run.
    pub fn last_success(&self) -> Option<&Run> {
        self.runs.values().rev().find(|run| run.status == RunStatus::Success)
    }

    /// The first run that failed after the last success, if the job is
    /// currently failing.
    pub fn first_failing(&self) -> Option<&Run> {
        let completed: BTreeMap<u64, Run> =
            self.runs.iter().filter(|(_, run)| run.has_ended()).map(|(n, r)| (*n, r.clone())).collect();
        let success = history::latest_success(&completed);
        let number = history::first_failing_after(&completed, success)?;
        self.runs.get(&number)
    }
}

/// Deployment status of one application: one [`JobStatus`] per job.
#[derive(Debug, Clone)]
pub struct DeploymentStatus {
    /// The application.
    pub application: TenantAndApplicationId,
    /// The system's current target platform version, when known.
    pub system_version: Option<Version>,
    /// When this snapshot was taken.
    pub at: DateTime<Utc>,
    /// Status per job, across the application's instances.
    pub jobs: Vec<JobStatus>,
}

impl DeploymentStatus {
    /// The status of the given job, if it has any runs.
    pub fn job(&self, id: &JobId) -> Option<&JobStatus> {
        self.jobs.iter().find(|status| &status.id == id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use larch_deploy_core::ApplicationId;
    use larch_deploy_core::ApplicationVersion;
    use larch_deploy_core::JobProfile;
    use larch_deploy_core::JobType;
    use larch_deploy_core::RunId;
    use larch_deploy_core::Versions;

    use super::*;

    fn job() -> JobId {
        JobId::new(ApplicationId::from_parts("t", "a", "default"), JobType::SystemTest)
    }

    fn run(number: u64, status: RunStatus, ended: bool) -> Run {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut run = Run::initial(
            RunId::new(job().application, JobType::SystemTest, number),
            Versions::from_target(Version::new(8, 1, 0), ApplicationVersion::from_build(number)),
            false,
            start,
            JobProfile::Production,
            None,
        );
        run.status = status;
        if ended {
            run.end = Some(start + chrono::Duration::minutes(number as i64));
        }
        run
    }

    #[test]
    fn views_over_a_mixed_history() {
        use RunStatus::*;
        let runs: BTreeMap<u64, Run> = [
            (1, run(1, Success, true)),
            (2, run(2, TestFailure, true)),
            (3, run(3, DeploymentFailed, true)),
            (4, run(4, Running, false)),
        ]
        .into();
        let status = JobStatus::new(job(), runs);

        assert_eq!(status.last().unwrap().id.number, 4);
        assert_eq!(status.last_completed().unwrap().id.number, 3);
        assert_eq!(status.last_success().unwrap().id.number, 1);
        assert_eq!(status.first_failing().unwrap().id.number, 2);
    }

    #[test]
    fn no_failure_after_latest_success() {
        use RunStatus::*;
        let runs: BTreeMap<u64, Run> = [(1, run(1, TestFailure, true)), (2, run(2, Success, true))].into();
        let status = JobStatus::new(job(), runs);
        assert!(status.first_failing().is_none());
    }
}
