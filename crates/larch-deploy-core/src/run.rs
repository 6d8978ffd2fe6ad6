//! The state of one job run.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::id::RunId;
use crate::step::JobProfile;
use crate::step::Step;
use crate::step::StepInfo;
use crate::step::StepStatus;
use crate::version::Versions;

/// Value of the test log cursor before any entry has been read.
pub const NO_TEST_LOG_ENTRY: i64 = -1;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// Run is in progress.
    Running,
    /// All steps succeeded.
    Success,
    /// The run was aborted; only run-always steps may still run.
    Aborted,
    /// A step failed for an unexpected reason.
    Error,
    /// The zone could not allocate capacity for the deployment.
    OutOfCapacity,
    /// Deployment of the real or tester application failed.
    DeploymentFailed,
    /// A deployment never converged.
    InstallationFailed,
    /// Tests ran and failed.
    TestFailure,
    /// The tester found no tests to run.
    NoTests,
    /// The run will be reset and start over from its first step.
    Reset,
}

impl RunStatus {
    /// True when the run has been parked in a failure status.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Running | Self::Success | Self::Reset)
    }
}

/// Violations of the run state machine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// The step is not part of this run's profile.
    #[snafu(display("step {step:?} is not part of {id}"))]
    StepNotPresent {
        /// The step that was addressed.
        step: Step,
        /// The run it was addressed in.
        id: RunId,
    },

    /// The step already reached a terminal status.
    #[snafu(display("step {step:?} of {id} is already finished"))]
    StepAlreadyFinished {
        /// The step that was addressed.
        step: Step,
        /// The run it was addressed in.
        id: RunId,
    },

    /// The tester certificate may only be set once.
    #[snafu(display("tester certificate for {id} is already set"))]
    CertificateAlreadySet {
        /// The run whose certificate was set.
        id: RunId,
    },
}

/// One attempt at a job: the status of each step, plus run-level metadata.
///
/// Values are immutable snapshots; transition helpers consume `self` and
/// return the updated run. Durable state lives in the store, which is
/// mutated only under the job's type lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Identity of this run.
    pub id: RunId,
    /// Versions this run moves between.
    pub versions: Versions,
    /// True when this run re-deploys an already-deployed revision.
    pub is_redeployment: bool,
    /// When the run was created.
    pub start: DateTime<Utc>,
    /// When the run was finalized, if it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// The profile this run was created from.
    pub profile: JobProfile,
    /// Next wakeup for the run's executor, if sleeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    /// Timestamp of the last platform log entry copied into the run log.
    pub last_platform_log_timestamp: DateTime<Utc>,
    /// Id of the last test log entry read from the tester.
    pub last_test_log_entry: i64,
    /// Free-form reason the run was started, if given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    steps: BTreeMap<Step, StepInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tester_certificate: Option<String>,
}

impl Run {
    /// The initial state of a new run: all profile steps unfinished.
    pub fn initial(
        id: RunId,
        versions: Versions,
        is_redeployment: bool,
        now: DateTime<Utc>,
        profile: JobProfile,
        reason: Option<String>,
    ) -> Self {
        let steps = profile.steps().iter().map(|step| (*step, StepInfo::default())).collect();
        Self {
            id,
            versions,
            is_redeployment,
            start: now,
            end: None,
            status: RunStatus::Running,
            profile,
            sleep_until: None,
            last_platform_log_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            last_test_log_entry: NO_TEST_LOG_ENTRY,
            reason,
            steps,
            tester_certificate: None,
        }
    }

    /// The status of every step, in execution order.
    pub fn steps(&self) -> &BTreeMap<Step, StepInfo> {
        &self.steps
    }

    /// Whether the given step is part of this run.
    pub fn has_step(&self, step: Step) -> bool {
        self.steps.contains_key(&step)
    }

    /// The status of the given step, if it is part of this run.
    pub fn step_status(&self, step: Step) -> Option<StepStatus> {
        self.steps.get(&step).map(|info| info.status)
    }

    /// Whether this run has been finalized.
    pub fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Whether this run has been parked in a failure status.
    pub fn has_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// The tester certificate for this run, if one has been stored.
    pub fn tester_certificate(&self) -> Option<&str> {
        self.tester_certificate.as_deref()
    }

    /// The unfinished steps which are ready to execute.
    ///
    /// While the run is healthy these are the steps whose prerequisites in
    /// this run have all succeeded. Once the run has failed or been aborted,
    /// only run-always steps remain eligible, gated on the other run-always
    /// steps before them being finished one way or the other.
    pub fn ready_steps(&self) -> Vec<Step> {
        let within: std::collections::BTreeSet<Step> = self.steps.keys().copied().collect();
        self.steps
            .iter()
            .filter(|(_, info)| info.status == StepStatus::Unfinished)
            .filter(|(step, _)| {
                if self.has_failed() {
                    step.is_always_run()
                        && step
                            .all_prerequisites(&within)
                            .into_iter()
                            .filter(Step::is_always_run)
                            .all(|p| self.steps[&p].status != StepStatus::Unfinished)
                } else {
                    step.all_prerequisites(&within)
                        .into_iter()
                        .all(|p| self.steps[&p].status == StepStatus::Succeeded)
                }
            })
            .map(|(step, _)| *step)
            .collect()
    }

    /// Record the outcome of a step.
    ///
    /// A `Running` status marks the step succeeded; anything else marks it
    /// failed and, if the run is still healthy, parks the run in that
    /// status — the first failure wins, later ones only mark their step.
    pub fn with_step_outcome(mut self, step: Step, status: RunStatus) -> Result<Self, RunError> {
        let info = self.steps.get_mut(&step).ok_or_else(|| RunError::StepNotPresent {
            step,
            id: self.id.clone(),
        })?;
        if info.status != StepStatus::Unfinished {
            return Err(RunError::StepAlreadyFinished {
                step,
                id: self.id.clone(),
            });
        }
        if status == RunStatus::Running {
            info.status = StepStatus::Succeeded;
        } else {
            info.status = StepStatus::Failed;
            if self.status == RunStatus::Running {
                self.status = status;
            }
        }
        Ok(self)
    }

    /// Record when a step started executing.
    pub fn with_step_start(mut self, step: Step, timestamp: DateTime<Utc>) -> Result<Self, RunError> {
        let info = self.steps.get_mut(&step).ok_or_else(|| RunError::StepNotPresent {
            step,
            id: self.id.clone(),
        })?;
        info.started_at = Some(timestamp);
        Ok(self)
    }

    /// This run, finalized at `now`.
    ///
    /// A run still `Running` derives its terminal status from its steps:
    /// all succeeded means success, otherwise the first failed step maps
    /// through `failure_statuses` (unmapped steps surface as `Error`). A
    /// run already parked in another status keeps it.
    pub fn finished(mut self, now: DateTime<Utc>, failure_statuses: &BTreeMap<Step, RunStatus>) -> Self {
        if self.status == RunStatus::Running {
            let first_failed = self
                .steps
                .iter()
                .find(|(_, info)| info.status == StepStatus::Failed)
                .map(|(step, _)| *step);
            self.status = match first_failed {
                None if self.steps.values().all(|info| info.status == StepStatus::Succeeded) => RunStatus::Success,
                None => RunStatus::Error,
                Some(step) => failure_statuses.get(&step).copied().unwrap_or(RunStatus::Error),
            };
        }
        self.end = Some(now);
        self
    }

    /// This run, marked aborted. Run-always steps remain eligible.
    pub fn aborted(mut self) -> Self {
        self.status = RunStatus::Aborted;
        self
    }

    /// This run, wound back to its initial step statuses.
    ///
    /// Number, start and sleep time are preserved; the test log cursor is
    /// cleared since the tester starts over.
    pub fn reset(mut self) -> Self {
        for info in self.steps.values_mut() {
            *info = StepInfo::default();
        }
        self.status = RunStatus::Running;
        self.end = None;
        self.last_test_log_entry = NO_TEST_LOG_ENTRY;
        self
    }

    /// This run, with the platform log cursor advanced.
    pub fn with_platform_log_cursor(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_platform_log_timestamp = timestamp;
        self
    }

    /// This run, with the test log cursor advanced.
    pub fn with_test_log_cursor(mut self, entry_id: i64) -> Self {
        self.last_test_log_entry = entry_id;
        self
    }

    /// This run, sleeping until the given time.
    pub fn sleeping_until(mut self, until: DateTime<Utc>) -> Self {
        self.sleep_until = Some(until);
        self
    }

    /// Store the tester certificate for this run. It may only be set once.
    pub fn with_tester_certificate(mut self, certificate_pem: impl Into<String>) -> Result<Self, RunError> {
        if self.tester_certificate.is_some() {
            return Err(RunError::CertificateAlreadySet { id: self.id.clone() });
        }
        self.tester_certificate = Some(certificate_pem.into());
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::id::ApplicationId;
    use crate::id::JobType;
    use crate::version::ApplicationVersion;
    use crate::version::Version;

    fn run() -> Run {
        let id = RunId::new(ApplicationId::from_parts("t", "a", "default"), JobType::SystemTest, 1);
        let versions = Versions::from_target(Version::new(8, 1, 0), ApplicationVersion::from_build(3));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Run::initial(id, versions, false, now, JobProfile::SystemTest, None)
    }

    fn succeed_all(mut run: Run) -> Run {
        let steps: Vec<Step> = run.steps().keys().copied().collect();
        for step in steps {
            run = run.with_step_outcome(step, RunStatus::Running).unwrap();
        }
        run
    }

    #[test]
    fn initial_run_has_all_profile_steps_unfinished() {
        let run = run();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.steps().len(), JobProfile::SystemTest.steps().len());
        assert!(run.steps().values().all(|info| info.status == StepStatus::Unfinished));
        assert_eq!(run.last_test_log_entry, NO_TEST_LOG_ENTRY);
    }

    #[test]
    fn only_dependency_free_steps_are_initially_ready() {
        let run = run();
        assert_eq!(run.ready_steps(), vec![Step::DeployTester, Step::DeployReal]);
    }

    #[test]
    fn finished_steps_are_immutable() {
        let run = run().with_step_outcome(Step::DeployReal, RunStatus::Running).unwrap();
        let result = run.with_step_outcome(Step::DeployReal, RunStatus::DeploymentFailed);
        assert!(matches!(result, Err(RunError::StepAlreadyFinished { .. })));
    }

    #[test]
    fn first_failure_parks_the_run_status() {
        let run = run()
            .with_step_outcome(Step::DeployReal, RunStatus::DeploymentFailed)
            .unwrap()
            .with_step_outcome(Step::DeployTester, RunStatus::Error)
            .unwrap();
        assert_eq!(run.status, RunStatus::DeploymentFailed);
        assert_eq!(run.step_status(Step::DeployTester), Some(StepStatus::Failed));
    }

    #[test]
    fn aborted_run_leaves_only_run_always_steps_ready() {
        let run = run().with_step_outcome(Step::DeployReal, RunStatus::Running).unwrap().aborted();
        let ready = run.ready_steps();
        assert!(!ready.is_empty());
        assert!(ready.iter().all(Step::is_always_run), "ready after abort: {ready:?}");
    }

    #[test]
    fn all_succeeded_finishes_as_success() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let finished = succeed_all(run()).finished(now, &BTreeMap::new());
        assert_eq!(finished.status, RunStatus::Success);
        assert_eq!(finished.end, Some(now));
    }

    #[test]
    fn failure_status_comes_from_the_configured_table() {
        let table: BTreeMap<Step, RunStatus> = [(Step::InstallReal, RunStatus::InstallationFailed)].into();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

        // The executor reported success for the step but parked nothing; a
        // lone failed step without a mapping surfaces as Error.
        let mut run = run();
        run.status = RunStatus::Running;
        let mut failed = run.clone();
        failed.steps.get_mut(&Step::EndTests).unwrap().status = StepStatus::Failed;
        assert_eq!(failed.clone().finished(now, &table).status, RunStatus::Error);

        let mut mapped = run;
        mapped.steps.get_mut(&Step::InstallReal).unwrap().status = StepStatus::Failed;
        assert_eq!(mapped.finished(now, &table).status, RunStatus::InstallationFailed);
    }

    #[test]
    fn reset_preserves_identity_and_clears_steps() {
        let run = succeed_all(run());
        let number = run.id.number;
        let start = run.start;
        let reset = run.sleeping_until(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()).reset();
        assert_eq!(reset.id.number, number);
        assert_eq!(reset.start, start);
        assert!(reset.sleep_until.is_some());
        assert_eq!(reset.status, RunStatus::Running);
        assert!(reset.steps().values().all(|info| info.status == StepStatus::Unfinished));
        assert_eq!(reset.last_test_log_entry, NO_TEST_LOG_ENTRY);
    }

    #[test]
    fn tester_certificate_is_write_once() {
        let run = run().with_tester_certificate("pem").unwrap();
        assert!(matches!(
            run.with_tester_certificate("other"),
            Err(RunError::CertificateAlreadySet { .. })
        ));
    }
}
