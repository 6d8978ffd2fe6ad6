//! The deployment job controller.
//!
//! A process-wide singleton owned by the platform controller. For each
//! (application, job type) pair it keeps a strictly increasing numbered
//! history of runs, starts and finalizes runs, records step outcomes
//! reported by executors, collects logs and test reports from the zone and
//! the tester, and garbage-collects data of removed applications.
//!
//! The controller performs no step work itself: an injected runner callback
//! drives the executor forward after state-changing calls.
//!
//! # Locking
//!
//! All mutations of a job's durable state happen under the job's type lock.
//! Step executors additionally hold a per-step lock, obtained through
//! [`JobController::lock_step`]; `finish` takes every prerequisite step
//! lock of the report step before the type lock, which guarantees no
//! executor is mid-mutation when a run is finalized. No lock edge crosses
//! applications.

mod dev;
mod queries;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Timelike;
use chrono::Utc;
use futures::future::BoxFuture;
use larch_core::KeyValueStore;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::ApplicationVersion;
use larch_deploy_core::DeploymentId;
use larch_deploy_core::JobProfile;
use larch_deploy_core::JobType;
use larch_deploy_core::LogEntry;
use larch_deploy_core::LogType;
use larch_deploy_core::Run;
use larch_deploy_core::RunId;
use larch_deploy_core::RunStatus;
use larch_deploy_core::Step;
use larch_deploy_core::StepStatus;
use larch_deploy_core::TesterId;
use larch_deploy_core::Versions;
use larch_deploy_core::ZoneId;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::ServiceRegistry;
use crate::apps::Application;
use crate::apps::ApplicationStore;
use crate::apps::Deployment;
use crate::error::JobError;
use crate::error::Result;
use crate::history;
use crate::lock;
use crate::lock::LockService;
use crate::lock::LockedStep;
use crate::logs::BufferedLogStore;
use crate::store::RunStore;

/// A callback driving the executor of a run forward.
pub type Runner = Arc<dyn Fn(Run) -> BoxFuture<'static, ()> + Send + Sync>;

/// History bound for continuous-deployment systems.
const CD_HISTORY_LENGTH: usize = 256;
/// History bound for all other systems.
const DEFAULT_HISTORY_LENGTH: usize = 64;
/// Reason logged when a run is aborted to make room for a replacement.
const REPLACED_REASON: &str = "replaced by new deployment";

/// Controller tunables.
#[derive(Clone)]
pub struct ControllerConfig {
    /// Bound on the number of historic runs kept per job.
    pub history_length: usize,
    /// Bound on type and application lock acquisition.
    pub lock_timeout: Duration,
    /// Bound on step lock acquisition, per step.
    pub step_lock_timeout: Duration,
    /// Poll interval while waiting for an aborted run to settle.
    pub abort_poll_interval: Duration,
    /// Historic runs older than this are evicted, retention exception aside.
    pub max_history_age: chrono::Duration,
    /// Terminal status per failing step; unmapped steps surface as `Error`.
    pub failure_statuses: BTreeMap<Step, RunStatus>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            history_length: DEFAULT_HISTORY_LENGTH,
            lock_timeout: Duration::from_secs(10),
            step_lock_timeout: Duration::from_secs(2),
            abort_poll_interval: Duration::from_millis(100),
            max_history_age: chrono::Duration::days(60),
            failure_statuses: default_failure_statuses(),
        }
    }
}

impl ControllerConfig {
    /// Configuration for a continuous-deployment system, which churns
    /// through runs fast enough to warrant the wider history bound.
    pub fn for_continuous_deployment() -> Self {
        Self {
            history_length: CD_HISTORY_LENGTH,
            ..Self::default()
        }
    }
}

fn external(service: &str, error: crate::adapters::ExternalError) -> JobError {
    JobError::External {
        service: service.to_string(),
        message: error.to_string(),
    }
}

fn default_failure_statuses() -> BTreeMap<Step, RunStatus> {
    use Step::*;
    [
        (DeployTester, RunStatus::DeploymentFailed),
        (DeployReal, RunStatus::DeploymentFailed),
        (InstallTester, RunStatus::InstallationFailed),
        (InstallReal, RunStatus::InstallationFailed),
        (StartStagingSetup, RunStatus::InstallationFailed),
        (EndStagingSetup, RunStatus::InstallationFailed),
        (StartTests, RunStatus::TestFailure),
        (EndTests, RunStatus::TestFailure),
    ]
    .into()
}

/// The deployment job controller. See the module docs.
pub struct JobController<S: KeyValueStore + ?Sized> {
    config: ControllerConfig,
    locks: Arc<LockService>,
    runs: RunStore<S>,
    logs: BufferedLogStore<S>,
    applications: ApplicationStore<S>,
    services: ServiceRegistry,
    runner: OnceLock<Runner>,
}

impl<S: KeyValueStore + ?Sized> JobController<S> {
    /// Wire a controller over the given store and collaborators.
    pub fn new(config: ControllerConfig, store: Arc<S>, services: ServiceRegistry) -> Self {
        let locks = Arc::new(LockService::with_timeout(config.lock_timeout));
        Self {
            config,
            locks,
            runs: RunStore::new(Arc::clone(&store)),
            logs: BufferedLogStore::new(Arc::clone(&store)),
            applications: ApplicationStore::new(store),
            services,
            runner: OnceLock::new(),
        }
    }

    /// The controller's configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Assign the runner callback. The slot is write-once; the bootstrap
    /// assigns it and later calls are ignored.
    pub fn set_runner(&self, runner: Runner) {
        if self.runner.set(runner).is_err() {
            warn!("runner callback is already set; ignoring reassignment");
        }
    }

    async fn run_step(&self, run: Run) {
        if let Some(runner) = self.runner.get() {
            runner(run).await;
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.services.clock.instant()
    }

    fn log_entry(&self, entry_type: LogType, message: impl Into<String>) -> LogEntry {
        LogEntry::new(self.now(), entry_type, message)
    }

    /// Apply a pure modification to the run, provided it is still active,
    /// under the job's type lock.
    async fn with_active_run<F>(&self, id: &RunId, modification: F) -> Result<()>
    where
        F: FnOnce(Run) -> Result<Run>,
    {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        if let Some(run) = self.active(id).await? {
            let updated = modification(run)?;
            self.runs.write_last_run(&updated).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Order a run of the given type for the application.
    ///
    /// Fails with `Conflict` while a run of the same job is active, and with
    /// `Invalid` when the target platform refuses the package's compile
    /// version. The caller drives the new run by invoking the runner with
    /// the last run of the job.
    pub async fn start(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        versions: Versions,
        is_redeployment: bool,
        profile: JobProfile,
        reason: Option<String>,
    ) -> Result<()> {
        if let Some(compile) = versions.target_application.compile_version {
            if self.services.version_compatibility.refuse(versions.target_platform, compile) {
                return Err(JobError::Invalid {
                    reason: format!(
                        "will not start a job with incompatible platform version ({}) and compile version ({compile})",
                        versions.target_platform
                    ),
                });
            }
        }

        let _guard = self.locks.lock(lock::job_key(application, job_type)).await?;
        let last = self.runs.read_last_run(application, job_type).await?;
        if last.as_ref().is_some_and(|run| !run.has_ended()) {
            return Err(JobError::Conflict {
                reason: format!("cannot start {job_type} for {application}; it is already running"),
            });
        }

        let number = last.map(|run| run.id.number).unwrap_or(0) + 1;
        let id = RunId::new(application.clone(), job_type.clone(), number);
        let run = Run::initial(id.clone(), versions, is_redeployment, self.now(), profile, reason);
        self.runs.write_last_run(&run).await?;
        self.services.metrics.job_started(&id.job());
        info!(run = %id, "started run");
        Ok(())
    }

    /// Finalize an active run into history.
    ///
    /// Takes every prerequisite step lock of the report step (in step
    /// order, bounded wait) to ensure no executor is mid-mutation, then the
    /// type lock. A run in `Reset` status is wound back to its first step
    /// instead; a healthy run with unfinished steps is left untouched.
    /// Finalizing an already-ended run is a no-op.
    pub async fn finish(&self, id: &RunId) -> Result<()> {
        let unlocked_run = self.run(id).await?.ok_or_else(|| JobError::NotFound {
            what: format!("{id}"),
        })?;

        // Report depends transitively on every other step, so holding all
        // its prerequisites proves no step executor is still running.
        let within = unlocked_run.steps().keys().copied().collect();
        let mut step_guards = Vec::new();
        for step in Step::Report.all_prerequisites(&within) {
            let key = lock::step_key(&id.application, &id.job_type, step);
            step_guards.push(self.locks.lock_with_timeout(key, self.config.step_lock_timeout).await?);
        }

        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        let Some(run) = self.active(id).await? else {
            return Ok(());
        };

        if run.status == RunStatus::Reset {
            let restart_at = run.sleep_until.unwrap_or_else(|| self.now());
            let restart_at = restart_at.with_nanosecond(0).unwrap_or(restart_at);
            for step in run.steps().keys().copied().collect::<Vec<_>>() {
                let entry = self.log_entry(LogType::Info, format!("### Run will reset, and start over at {restart_at}"));
                self.logs.append(&id.application, &id.job_type, step, vec![entry]).await?;
            }
            info!(run = %id, "resetting run");
            self.runs.write_last_run(&run.reset()).await?;
            return Ok(());
        }

        if run.status == RunStatus::Running
            && run.steps().values().any(|info| info.status != StepStatus::Succeeded)
        {
            return Ok(());
        }

        let finished = run.finished(self.now(), &self.config.failure_statuses);

        // History first, the active slot after, so a crash in between is
        // healed by re-running finish rather than losing the run.
        let mut historic = self.runs.read_historic_runs(&id.application, &id.job_type).await?;
        historic.insert(id.number, finished.clone());
        for number in history::runs_to_evict(&historic, self.config.history_length, self.config.max_history_age, self.now())
        {
            historic.remove(&number);
            self.logs.delete(&RunId::new(id.application.clone(), id.job_type.clone(), number)).await?;
        }
        self.runs.write_historic_runs(&id.application, &id.job_type, &historic).await?;
        self.runs.write_last_run(&finished).await?;

        self.logs.flush(id).await?;
        self.services.metrics.job_finished(&id.job(), finished.status);
        info!(run = %id, status = ?finished.status, "finished run");

        // Diffs for builds no retained run references can go.
        if let Some(oldest_build) = historic.values().map(|run| run.versions.target_application.build).min() {
            let artifacts = &self.services.artifact_store;
            let result = if finished.versions.target_application.deployed_directly {
                let deployment = DeploymentId::new(id.application.clone(), id.job_type.zone());
                artifacts.prune_dev_diffs(&deployment, oldest_build).await
            } else {
                artifacts.prune_diffs(&id.application.tenant, &id.application.application, oldest_build).await
            };
            result.map_err(|e| external("artifact store", e))?;
        }

        Ok(())
    }

    /// Mark the active run aborted.
    ///
    /// Every unfinished step gets a log line with the reason; only
    /// run-always steps remain eligible afterwards, and a subsequent
    /// [`JobController::finish`] collapses the run.
    pub async fn abort(&self, id: &RunId, reason: &str) -> Result<()> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        let Some(run) = self.active(id).await? else {
            return Ok(());
        };

        let unfinished: Vec<Step> = run
            .steps()
            .iter()
            .filter(|(_, info)| info.status == StepStatus::Unfinished)
            .map(|(step, _)| *step)
            .collect();
        for step in unfinished {
            let entry = self.log_entry(LogType::Info, format!("Aborting run: {reason}"));
            self.logs.append(&id.application, &id.job_type, step, vec![entry]).await?;
        }

        info!(run = %id, reason, "aborting run");
        self.runs.write_last_run(&run.aborted()).await?;
        Ok(())
    }

    /// Abort the run and wait for it to settle.
    ///
    /// Invokes the runner once to drive the teardown, then polls the job's
    /// last run at a bounded interval until its end timestamp is set. The
    /// wait is promptly cancellable at every poll.
    pub async fn abort_and_wait(&self, id: &RunId) -> Result<()> {
        self.abort(id, REPLACED_REASON).await?;

        let missing = || JobError::NotFound {
            what: format!("{id}"),
        };
        let last = self.last(&id.application, &id.job_type).await?.ok_or_else(missing)?;
        self.run_step(last).await;

        loop {
            let last = self.last(&id.application, &id.job_type).await?.ok_or_else(missing)?;
            if last.has_ended() {
                return Ok(());
            }
            tokio::time::sleep(self.config.abort_poll_interval).await;
        }
    }

    // ========================================================================
    // Step reporting
    // ========================================================================

    /// Acquire the step's lock and verify none of its prerequisites are
    /// being executed. The returned token is the executor's permission to
    /// report status for the step.
    pub async fn lock_step(&self, application: &ApplicationId, job_type: &JobType, step: Step) -> Result<LockedStep> {
        let key = lock::step_key(application, job_type, step);
        let guard = self.locks.lock_with_timeout(key, self.config.step_lock_timeout).await?;

        let run = self.last(application, job_type).await?.ok_or_else(|| JobError::NotFound {
            what: format!("last run of {job_type} for {application}"),
        })?;
        let within = run.steps().keys().copied().collect();
        for prerequisite in step.all_prerequisites(&within) {
            let key = lock::step_key(application, job_type, prerequisite);
            drop(self.locks.lock_with_timeout(key, self.config.step_lock_timeout).await?);
        }

        Ok(LockedStep::new(step, guard))
    }

    /// Record the outcome of the locked step, provided the run is still
    /// active. A `Running` status marks the step succeeded; any other
    /// status marks it failed and parks a healthy run in that status.
    pub async fn update(&self, id: &RunId, status: RunStatus, step: &LockedStep) -> Result<()> {
        let step = step.step();
        self.with_active_run(id, |run| Ok(run.with_step_outcome(step, status)?)).await
    }

    /// Record when the locked step started executing.
    pub async fn set_start_timestamp(&self, id: &RunId, timestamp: DateTime<Utc>, step: &LockedStep) -> Result<()> {
        let step = step.step();
        self.with_active_run(id, |run| Ok(run.with_step_start(step, timestamp)?)).await
    }

    /// Store the tester certificate for the run. It may only be set once.
    pub async fn store_tester_certificate(&self, id: &RunId, certificate_pem: String) -> Result<()> {
        self.with_active_run(id, |run| Ok(run.with_tester_certificate(certificate_pem)?)).await
    }

    /// Put the active run to sleep until the given time.
    pub async fn sleep_until(&self, id: &RunId, until: DateTime<Utc>) -> Result<()> {
        self.with_active_run(id, |run| Ok(run.sleeping_until(until))).await
    }

    // ========================================================================
    // Log and report collection
    // ========================================================================

    /// Store log messages for the given run and step, provided the run is
    /// still active.
    pub async fn log(&self, id: &RunId, step: Step, entry_type: LogType, messages: Vec<String>) -> Result<()> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        if self.active(id).await?.is_none() {
            return Ok(());
        }
        let entries = messages.into_iter().map(|message| self.log_entry(entry_type, message)).collect();
        self.logs.append(&id.application, &id.job_type, step, entries).await
    }

    /// Fetch any new platform log entries from the zone, and advance the
    /// run's platform log cursor. No-op without a copy-platform-logs step,
    /// or before the run's own deployment is activated. Collaborator
    /// failures are swallowed; the next poll retries.
    pub async fn update_platform_log(&self, id: &RunId) -> Result<()> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        let Some(run) = self.active(id).await? else {
            return Ok(());
        };
        if !run.has_step(Step::CopyPlatformLogs) {
            return Ok(());
        }

        let zone = id.job_type.zone();
        let record = self.applications.read(&id.application.tenant_and_application()).await?;
        let Some(deployment) = record.as_ref().and_then(|a| a.deployment(&id.application.instance, &zone)) else {
            return Ok(());
        };
        if deployment.at < run.start {
            return Ok(()); // Deployment of a previous run.
        }

        let cursor = run.last_platform_log_timestamp;
        let from = cursor.max(deployment.at);
        let deployment_id = DeploymentId::new(id.application.clone(), zone);
        let entries = match self.services.config_server.get_logs(&deployment_id, from).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(run = %id, error = %e, "failed to fetch platform logs; will retry");
                return Ok(());
            }
        };
        let fresh: Vec<LogEntry> = entries.into_iter().filter(|entry| entry.at > cursor).collect();
        let Some(last_at) = fresh.iter().map(|entry| entry.at).max() else {
            return Ok(());
        };

        self.logs.append(&id.application, &id.job_type, Step::CopyPlatformLogs, fresh).await?;
        self.runs.write_last_run(&run.with_platform_log_cursor(last_at)).await?;
        Ok(())
    }

    /// Fetch any new test log entries from the tester, and advance the
    /// run's test log cursor. No-op unless a test-producing step is ready.
    /// Collaborator failures are swallowed; the next poll retries.
    pub async fn update_test_log(&self, id: &RunId) -> Result<()> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        let Some(run) = self.active(id).await? else {
            return Ok(());
        };
        let ready = run.ready_steps();
        let Some(step) = [Step::EndStagingSetup, Step::EndTests].into_iter().find(|s| ready.contains(s)) else {
            return Ok(());
        };

        let deployment = DeploymentId::new(id.tester().id().clone(), id.job_type.zone());
        let entries = match self.services.tester_cloud.get_log(&deployment, run.last_test_log_entry).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(run = %id, error = %e, "failed to fetch test log; will retry");
                return Ok(());
            }
        };
        // The cursor tracks the tester's own entry ids, before the log
        // store renumbers them.
        let Some(cursor) = entries.iter().map(|entry| entry.id as i64).max() else {
            return Ok(());
        };

        self.logs.append(&id.application, &id.job_type, step, entries).await?;
        self.runs.write_last_run(&run.with_test_log_cursor(cursor)).await?;
        Ok(())
    }

    /// Fetch the test report from the tester, if one is available, and
    /// store it with the run.
    pub async fn update_test_report(&self, id: &RunId) -> Result<()> {
        let _guard = self.locks.lock(lock::job_key(&id.application, &id.job_type)).await?;
        if self.active(id).await?.is_none() {
            return Ok(());
        }

        let deployment = DeploymentId::new(id.tester().id().clone(), id.job_type.zone());
        let report = self
            .services
            .tester_cloud
            .get_test_report(&deployment)
            .await
            .map_err(|e| external("tester cloud", e))?;
        match report {
            Some(report) => self.logs.write_test_report(id, &report).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Remove the tester deployment paired with the given job.
    pub async fn deactivate_tester(&self, tester: &TesterId, job_type: &JobType) -> Result<()> {
        let deployment = DeploymentId::new(tester.id().clone(), job_type.zone());
        self.services.config_server.deactivate(&deployment).await.map_err(|e| external("config server", e))
    }

    /// Delete run data and tester deployments of applications which are no
    /// longer registered.
    ///
    /// Per stale application, each job is cleaned under its deactivate-
    /// tester step lock and type lock. A failed cleanup (tester
    /// deactivation included) leaves that job's data and the application's
    /// root namespace in place, so the next sweep retries; jobs already
    /// cleaned stay cleaned.
    pub async fn collect_garbage(&self) -> Result<()> {
        let sweep = Uuid::new_v4();
        let live: std::collections::BTreeSet<ApplicationId> = self.instances().await?.into_iter().collect();

        for application in self.runs.applications_with_jobs().await? {
            if live.contains(&application) {
                continue;
            }
            let tester = TesterId::of(&application);
            let mut cleaned = true;
            for job_type in self.runs.job_types(&application).await? {
                if let Err(e) = self.collect_garbage_for_job(&application, &job_type, &tester).await {
                    warn!(sweep = %sweep, application = %application, job = %job_type, error = %e,
                          "garbage collection failed; leaving data for next sweep");
                    cleaned = false;
                    break;
                }
            }
            if cleaned {
                self.runs.delete_run_data(&application).await?;
                self.logs.delete_application(&application).await?;
                info!(sweep = %sweep, application = %application, "collected run data of removed application");
            }
        }
        Ok(())
    }

    async fn collect_garbage_for_job(
        &self,
        application: &ApplicationId,
        job_type: &JobType,
        tester: &TesterId,
    ) -> Result<()> {
        let _step_guard = self
            .locks
            .lock_with_timeout(
                lock::step_key(application, job_type, Step::DeactivateTester),
                self.config.step_lock_timeout,
            )
            .await?;
        let _guard = self.locks.lock(lock::job_key(application, job_type)).await?;

        self.deactivate_tester(tester, job_type).await?;
        self.runs.delete_run_data_for_type(application, job_type).await?;
        self.logs.delete_for_type(application, job_type).await?;
        Ok(())
    }

    /// Rewrite all stored last runs in the newest serialization format.
    pub async fn update_storage(&self) -> Result<()> {
        for application in self.runs.applications_with_jobs().await? {
            for job_type in self.runs.job_types(&application).await? {
                let _guard = self.locks.lock(lock::job_key(&application, &job_type)).await?;
                if let Some(run) = self.runs.read_last_run(&application, &job_type).await? {
                    self.runs.write_last_run(&run).await?;
                }
            }
        }
        Ok(())
    }

    /// Record an activated deployment of an application instance, under the
    /// application lock. Creates the record and instance as needed.
    pub async fn record_deployment(
        &self,
        id: &ApplicationId,
        zone: ZoneId,
        version: ApplicationVersion,
    ) -> Result<()> {
        let tenant_and_application = id.tenant_and_application();
        let _guard = self.locks.lock(lock::application_key(&tenant_and_application)).await?;
        let mut record = self
            .applications
            .read(&tenant_and_application)
            .await?
            .unwrap_or_else(|| Application::new(tenant_and_application));
        record.put_deployment(&id.instance, Deployment {
            zone,
            version,
            at: self.now(),
        });
        self.applications.write(&record).await
    }
}
