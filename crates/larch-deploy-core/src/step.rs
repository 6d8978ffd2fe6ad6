//! Job steps, their prerequisite DAG, and job profiles.

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::id::JobType;

/// A unit of work within a run.
///
/// Declaration order is the canonical execution order; ordered maps keyed by
/// step follow it. Each step has static prerequisites; a step may only
/// succeed once every prerequisite present in its run has succeeded.
/// Run-always steps remain eligible after an abort, so a run can tear down
/// and report before it collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    /// Deploy the tester application.
    DeployTester,
    /// Wait for the tester deployment to come up.
    InstallTester,
    /// Deploy the real application.
    DeployReal,
    /// Wait for the real deployment to come up.
    InstallReal,
    /// Ask the tester to populate production-like state.
    StartStagingSetup,
    /// Wait for staging setup to complete.
    EndStagingSetup,
    /// Ask the tester to start running tests.
    StartTests,
    /// Wait for tests to complete.
    EndTests,
    /// Copy platform log entries from the zone into the run log.
    CopyPlatformLogs,
    /// Remove the real deployment.
    DeactivateReal,
    /// Remove the tester deployment.
    DeactivateTester,
    /// Report the outcome of the run.
    Report,
}

impl Step {
    /// Direct prerequisites of this step in the static DAG.
    pub fn prerequisites(&self) -> &'static [Step] {
        use Step::*;
        match self {
            DeployTester => &[],
            InstallTester => &[DeployTester],
            DeployReal => &[],
            InstallReal => &[DeployReal],
            StartStagingSetup => &[InstallTester],
            EndStagingSetup => &[StartStagingSetup],
            StartTests => &[InstallReal, InstallTester, EndStagingSetup],
            EndTests => &[StartTests],
            CopyPlatformLogs => &[DeployReal],
            DeactivateReal => &[DeployReal, CopyPlatformLogs],
            DeactivateTester => &[DeployTester, EndTests],
            Report => &[DeactivateReal, DeactivateTester],
        }
    }

    /// The step's name, as used in lock and store keys.
    pub fn name(&self) -> &'static str {
        match self {
            Step::DeployTester => "deployTester",
            Step::InstallTester => "installTester",
            Step::DeployReal => "deployReal",
            Step::InstallReal => "installReal",
            Step::StartStagingSetup => "startStagingSetup",
            Step::EndStagingSetup => "endStagingSetup",
            Step::StartTests => "startTests",
            Step::EndTests => "endTests",
            Step::CopyPlatformLogs => "copyPlatformLogs",
            Step::DeactivateReal => "deactivateReal",
            Step::DeactivateTester => "deactivateTester",
            Step::Report => "report",
        }
    }

    /// Whether this step still runs after the run is aborted or has failed.
    pub fn is_always_run(&self) -> bool {
        matches!(
            self,
            Step::CopyPlatformLogs | Step::DeactivateReal | Step::DeactivateTester | Step::Report
        )
    }

    /// The transitive prerequisites of this step which are present in
    /// `within`, in canonical step order.
    ///
    /// Traversal passes through steps absent from `within`: a profile
    /// without deactivation steps still reaches the deploy steps behind
    /// them.
    pub fn all_prerequisites(&self, within: &BTreeSet<Step>) -> Vec<Step> {
        let mut collected = BTreeSet::new();
        let mut pending: Vec<Step> = self.prerequisites().to_vec();
        let mut visited = BTreeSet::new();
        while let Some(step) = pending.pop() {
            if !visited.insert(step) {
                continue;
            }
            if within.contains(&step) {
                collected.insert(step);
            }
            pending.extend_from_slice(step.prerequisites());
        }
        collected.into_iter().collect()
    }
}

/// Completion state of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    /// Not yet finished; the step may still run.
    #[default]
    Unfinished,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

/// Status and timing of a step within one run.
///
/// Once the status leaves [`StepStatus::Unfinished`] it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    /// Completion state.
    pub status: StepStatus,
    /// When the step last started executing, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// The ordered set of steps a run of a given kind consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobProfile {
    /// Full test deployment with a tester.
    SystemTest,
    /// Staging verification with setup of production-like state.
    StagingTest,
    /// Production deployment; the deployment stays up.
    Production,
    /// Developer deployment; the deployment stays up, logs are copied.
    Development,
    /// Developer dry run; nothing is installed.
    DevelopmentDryRun,
}

impl JobProfile {
    /// The default profile for a job type.
    pub fn of(job_type: &JobType) -> Self {
        match job_type {
            JobType::SystemTest => Self::SystemTest,
            JobType::StagingTest => Self::StagingTest,
            JobType::Production { .. } => Self::Production,
            JobType::Test { .. } => Self::SystemTest,
            JobType::Dev { .. } => Self::Development,
            JobType::Perf { .. } => Self::Development,
        }
    }

    /// The steps of this profile, in execution order.
    pub fn steps(&self) -> &'static [Step] {
        use Step::*;
        match self {
            Self::SystemTest => &[
                DeployTester,
                InstallTester,
                DeployReal,
                InstallReal,
                StartTests,
                EndTests,
                CopyPlatformLogs,
                DeactivateReal,
                DeactivateTester,
                Report,
            ],
            Self::StagingTest => &[
                DeployTester,
                InstallTester,
                DeployReal,
                InstallReal,
                StartStagingSetup,
                EndStagingSetup,
                StartTests,
                EndTests,
                CopyPlatformLogs,
                DeactivateReal,
                DeactivateTester,
                Report,
            ],
            Self::Production => &[DeployReal, InstallReal, Report],
            Self::Development => &[DeployReal, InstallReal, CopyPlatformLogs, Report],
            Self::DevelopmentDryRun => &[DeployReal, Report],
        }
    }
}
