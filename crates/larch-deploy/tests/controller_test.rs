//! End-to-end tests of the deployment job controller, over the in-memory
//! store, a manual clock and scripted collaborators.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use futures::FutureExt;
use larch_core::MemoryKeyValueStore;
use larch_deploy::adapters::ExternalResult;
use larch_deploy::ApplicationStore;
use larch_deploy::ConfigServer;
use larch_deploy::ControllerConfig;
use larch_deploy::ExternalError;
use larch_deploy::JobController;
use larch_deploy::JobError;
use larch_deploy::JobMetrics;
use larch_deploy::ManualClock;
use larch_deploy::PackageDiffer;
use larch_deploy::Runner;
use larch_deploy::ServiceRegistry;
use larch_deploy::TesterCloud;
use larch_deploy::VersionCompatibility;
use larch_deploy::VersionStatus;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::ApplicationName;
use larch_deploy_core::ApplicationPackage;
use larch_deploy_core::ApplicationVersion;
use larch_deploy_core::DeploymentId;
use larch_deploy_core::JobId;
use larch_deploy_core::JobProfile;
use larch_deploy_core::JobType;
use larch_deploy_core::LogEntry;
use larch_deploy_core::LogType;
use larch_deploy_core::Run;
use larch_deploy_core::RunId;
use larch_deploy_core::RunStatus;
use larch_deploy_core::Step;
use larch_deploy_core::TenantName;
use larch_deploy_core::TestReport;
use larch_deploy_core::Version;
use larch_deploy_core::Versions;

// ============================================================================
// Scripted collaborators
// ============================================================================

#[derive(Default)]
struct ScriptedConfigServer {
    log_batches: Mutex<VecDeque<Vec<LogEntry>>>,
    deactivated: Mutex<Vec<DeploymentId>>,
    failing_zones: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl ConfigServer for ScriptedConfigServer {
    async fn get_logs(&self, _deployment: &DeploymentId, _from: DateTime<Utc>) -> ExternalResult<Vec<LogEntry>> {
        Ok(self.log_batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn deactivate(&self, deployment: &DeploymentId) -> ExternalResult<()> {
        if self.failing_zones.lock().unwrap().contains(&deployment.zone.to_string()) {
            return Err(ExternalError::new("config server unavailable"));
        }
        self.deactivated.lock().unwrap().push(deployment.clone());
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedTesterCloud {
    entries: Mutex<Vec<LogEntry>>,
    report: Mutex<Option<TestReport>>,
}

#[async_trait]
impl TesterCloud for ScriptedTesterCloud {
    async fn get_log(&self, _deployment: &DeploymentId, after: i64) -> ExternalResult<Vec<LogEntry>> {
        Ok(self.entries.lock().unwrap().iter().filter(|entry| entry.id as i64 > after).cloned().collect())
    }

    async fn get_test_report(&self, _deployment: &DeploymentId) -> ExternalResult<Option<TestReport>> {
        Ok(self.report.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingArtifactStore {
    submitted: Mutex<BTreeMap<u64, Vec<u8>>>,
    testers: Mutex<BTreeMap<u64, Vec<u8>>>,
    dev_packages: Mutex<BTreeMap<u64, Vec<u8>>>,
    diffs: Mutex<BTreeMap<u64, Vec<u8>>>,
    pruned_at: Mutex<Vec<u64>>,
    pruned_diffs_before: Mutex<Vec<u64>>,
    pruned_dev_diffs_before: Mutex<Vec<u64>>,
}

#[async_trait]
impl larch_deploy::ArtifactStore for RecordingArtifactStore {
    async fn put(
        &self,
        _tenant: &TenantName,
        _application: &ApplicationName,
        version: &ApplicationVersion,
        package: &[u8],
        diff: &[u8],
    ) -> ExternalResult<()> {
        self.submitted.lock().unwrap().insert(version.build, package.to_vec());
        self.diffs.lock().unwrap().insert(version.build, diff.to_vec());
        Ok(())
    }

    async fn put_tester(
        &self,
        _tenant: &TenantName,
        _application: &ApplicationName,
        version: &ApplicationVersion,
        test_package: &[u8],
    ) -> ExternalResult<()> {
        self.testers.lock().unwrap().insert(version.build, test_package.to_vec());
        Ok(())
    }

    async fn put_meta(
        &self,
        _tenant: &TenantName,
        _application: &ApplicationName,
        _at: DateTime<Utc>,
        _metadata: &[u8],
    ) -> ExternalResult<()> {
        Ok(())
    }

    async fn put_dev(
        &self,
        _deployment: &DeploymentId,
        version: &ApplicationVersion,
        package: &[u8],
        diff: &[u8],
    ) -> ExternalResult<()> {
        self.dev_packages.lock().unwrap().insert(version.build, package.to_vec());
        self.diffs.lock().unwrap().insert(version.build, diff.to_vec());
        Ok(())
    }

    async fn get(&self, _deployment: &DeploymentId, version: &ApplicationVersion) -> ExternalResult<Vec<u8>> {
        self.dev_packages
            .lock()
            .unwrap()
            .get(&version.build)
            .cloned()
            .ok_or_else(|| ExternalError::new(format!("no dev package for build {}", version.build)))
    }

    async fn find(&self, _tenant: &TenantName, _application: &ApplicationName, build: u64) -> ExternalResult<Option<Vec<u8>>> {
        Ok(self.submitted.lock().unwrap().get(&build).cloned())
    }

    async fn prune(
        &self,
        _tenant: &TenantName,
        _application: &ApplicationName,
        oldest_deployed: &ApplicationVersion,
    ) -> ExternalResult<()> {
        self.pruned_at.lock().unwrap().push(oldest_deployed.build);
        Ok(())
    }

    async fn prune_testers(
        &self,
        _tenant: &TenantName,
        _application: &ApplicationName,
        _oldest_deployed: &ApplicationVersion,
    ) -> ExternalResult<()> {
        Ok(())
    }

    async fn prune_diffs(&self, _tenant: &TenantName, _application: &ApplicationName, before_build: u64) -> ExternalResult<()> {
        self.pruned_diffs_before.lock().unwrap().push(before_build);
        Ok(())
    }

    async fn prune_dev_diffs(&self, _deployment: &DeploymentId, before_build: u64) -> ExternalResult<()> {
        self.pruned_dev_diffs_before.lock().unwrap().push(before_build);
        Ok(())
    }
}

struct StaticVersionStatus {
    versions: Vec<Version>,
}

impl VersionStatus for StaticVersionStatus {
    fn deployable_versions(&self) -> Vec<Version> {
        self.versions.clone()
    }

    fn is_active(&self, version: &Version) -> bool {
        self.versions.contains(version)
    }
}

/// Packages may run on platforms of the same major.
struct MajorMatch;

impl VersionCompatibility for MajorMatch {
    fn accept(&self, platform: Version, compile: Version) -> bool {
        platform.major == compile.major
    }
}

struct LabelDiffer;

impl PackageDiffer for LabelDiffer {
    fn diff(&self, previous: &ApplicationPackage, next: &ApplicationPackage) -> Vec<u8> {
        format!("diff from {} to {}", previous.bundle_hash(), next.bundle_hash()).into_bytes()
    }

    fn diff_against_empty(&self, next: &ApplicationPackage) -> Vec<u8> {
        format!("initial {}", next.bundle_hash()).into_bytes()
    }
}

#[derive(Default)]
struct CountingMetrics {
    started: Mutex<Vec<JobId>>,
    finished: Mutex<Vec<(JobId, RunStatus)>>,
}

impl JobMetrics for CountingMetrics {
    fn job_started(&self, job: &JobId) {
        self.started.lock().unwrap().push(job.clone());
    }

    fn job_finished(&self, job: &JobId, status: RunStatus) {
        self.finished.lock().unwrap().push((job.clone(), status));
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    controller: Arc<JobController<MemoryKeyValueStore>>,
    store: Arc<MemoryKeyValueStore>,
    clock: Arc<ManualClock>,
    config_server: Arc<ScriptedConfigServer>,
    tester_cloud: Arc<ScriptedTesterCloud>,
    artifacts: Arc<RecordingArtifactStore>,
    metrics: Arc<CountingMetrics>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn harness_with(config: ControllerConfig) -> Harness {
    let store = MemoryKeyValueStore::new();
    let clock = ManualClock::new(start_time());
    let config_server = Arc::new(ScriptedConfigServer::default());
    let tester_cloud = Arc::new(ScriptedTesterCloud::default());
    let artifacts = Arc::new(RecordingArtifactStore::default());
    let metrics = Arc::new(CountingMetrics::default());

    let services = ServiceRegistry {
        config_server: config_server.clone(),
        tester_cloud: tester_cloud.clone(),
        artifact_store: artifacts.clone(),
        package_differ: Arc::new(LabelDiffer),
        version_status: Arc::new(StaticVersionStatus {
            versions: vec![Version::new(7, 9, 0), Version::new(8, 1, 0), Version::new(8, 2, 0)],
        }),
        version_compatibility: Arc::new(MajorMatch),
        clock: clock.clone(),
        metrics: metrics.clone(),
    };

    let controller = Arc::new(JobController::new(config, Arc::clone(&store), services));
    controller.set_runner(teardown_runner(Arc::clone(&controller)));

    Harness {
        controller,
        store,
        clock,
        config_server,
        tester_cloud,
        artifacts,
        metrics,
    }
}

fn harness() -> Harness {
    harness_with(ControllerConfig::default())
}

/// A runner that settles aborted or failed runs: it succeeds their
/// remaining run-always steps and finalizes them, and leaves healthy runs
/// to the test to drive.
fn teardown_runner(controller: Arc<JobController<MemoryKeyValueStore>>) -> Runner {
    Arc::new(move |run: Run| {
        let controller = Arc::clone(&controller);
        async move {
            let id = run.id;
            loop {
                let Some(current) = controller.active(&id).await.unwrap() else {
                    return;
                };
                if !current.has_failed() {
                    return;
                }
                let ready = current.ready_steps();
                if ready.is_empty() {
                    break;
                }
                for step in ready {
                    let locked = controller.lock_step(&id.application, &id.job_type, step).await.unwrap();
                    controller.update(&id, RunStatus::Running, &locked).await.unwrap();
                }
            }
            controller.finish(&id).await.unwrap();
        }
        .boxed()
    })
}

fn app() -> ApplicationId {
    ApplicationId::from_parts("tenant", "app", "default")
}

fn versions(build: u64) -> Versions {
    Versions::from_target(Version::new(8, 1, 0), ApplicationVersion::from_build(build))
}

async fn start_run(harness: &Harness, job_type: &JobType, profile: JobProfile, build: u64) -> RunId {
    harness
        .controller
        .start(&app(), job_type, versions(build), false, profile, None)
        .await
        .unwrap();
    harness.controller.last(&app(), job_type).await.unwrap().unwrap().id
}

/// Succeed every remaining step of the run and finalize it.
async fn run_to_completion(harness: &Harness, id: &RunId) {
    loop {
        let run = harness.controller.active(id).await.unwrap().expect("run should be active");
        let ready = run.ready_steps();
        if ready.is_empty() {
            break;
        }
        for step in ready {
            let locked = harness.controller.lock_step(&id.application, &id.job_type, step).await.unwrap();
            harness.controller.update(id, RunStatus::Running, &locked).await.unwrap();
        }
    }
    harness.controller.finish(id).await.unwrap();
}

/// Fail the given step with the given status, then settle the run.
async fn fail_and_complete(harness: &Harness, id: &RunId, failing: Step, status: RunStatus) {
    let locked = harness.controller.lock_step(&id.application, &id.job_type, failing).await.unwrap();
    harness.controller.update(id, status, &locked).await.unwrap();
    drop(locked);
    run_to_completion(harness, id).await;
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn simple_success_run() {
    let harness = harness();
    let job_type = JobType::SystemTest;
    let id = start_run(&harness, &job_type, JobProfile::SystemTest, 1).await;
    assert_eq!(id.number, 1);
    assert_eq!(harness.metrics.started.lock().unwrap().len(), 1);

    harness
        .controller
        .log(&id, Step::DeployReal, LogType::Info, vec!["deploying the real application".to_string()])
        .await
        .unwrap();
    run_to_completion(&harness, &id).await;

    let last = harness.controller.last(&app(), &job_type).await.unwrap().unwrap();
    assert_eq!(last.status, RunStatus::Success);
    assert!(last.has_ended());
    assert!(harness.controller.active(&id).await.unwrap().is_none());

    let history = harness.controller.runs(&app(), &job_type).await.unwrap();
    assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![1]);

    // The log was sealed by finish and is still readable.
    let details = harness.controller.details(&id, 0).await.unwrap().unwrap();
    assert_eq!(details.len(), 1);

    let finished = harness.metrics.finished.lock().unwrap().clone();
    assert_eq!(finished, vec![(id.job(), RunStatus::Success)]);
}

#[tokio::test]
async fn second_start_conflicts_while_active() {
    let harness = harness();
    start_run(&harness, &JobType::SystemTest, JobProfile::SystemTest, 1).await;

    let result = harness
        .controller
        .start(&app(), &JobType::SystemTest, versions(2), false, JobProfile::SystemTest, None)
        .await;
    assert!(matches!(result, Err(JobError::Conflict { .. })), "got {result:?}");
}

#[tokio::test]
async fn incompatible_compile_version_is_refused() {
    let harness = harness();
    let mut incompatible = versions(1);
    incompatible.target_application.compile_version = Some(Version::new(7, 9, 0));

    let result = harness
        .controller
        .start(&app(), &JobType::SystemTest, incompatible, false, JobProfile::SystemTest, None)
        .await;
    assert!(matches!(result, Err(JobError::Invalid { .. })), "got {result:?}");
}

#[tokio::test]
async fn deploy_aborts_and_replaces_the_active_run() {
    let harness = harness();
    let job_type = JobType::dev("us-east-1");
    let first = start_run(&harness, &job_type, JobProfile::Development, 1).await;

    let package = ApplicationPackage::new(b"v2 package".to_vec()).with_compile_version(Version::new(8, 1, 0));
    harness.controller.deploy(&app(), &job_type, None, &package, false).await.unwrap();

    // The previous run was aborted and has settled.
    let previous = harness.controller.run(&first).await.unwrap().unwrap();
    assert_eq!(previous.status, RunStatus::Aborted);
    assert!(previous.has_ended());
    let aborted_log = harness.controller.details(&first, 0).await.unwrap().unwrap();
    let messages: Vec<&str> = aborted_log.entries.values().flatten().map(|e| e.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("Aborting run: replaced by new deployment")), "log: {messages:?}");

    // The replacement is the next number and is active.
    let last = harness.controller.last(&app(), &job_type).await.unwrap().unwrap();
    assert_eq!(last.id.number, first.number + 1);
    assert!(!last.has_ended());
    assert_eq!(last.versions.target_application.build, 2);
    assert!(last.versions.target_application.deployed_directly);
    assert_eq!(last.versions.target_platform, Version::new(8, 1, 0));

    // The package landed in the artifact store under the new build.
    assert!(harness.artifacts.dev_packages.lock().unwrap().contains_key(&2));
}

#[tokio::test]
async fn dev_deploy_picks_newest_compatible_platform() {
    let harness = harness();
    let job_type = JobType::dev("us-east-1");
    let package = ApplicationPackage::new(b"package".to_vec()).with_compile_version(Version::new(8, 1, 0));
    harness.controller.deploy(&app(), &job_type, None, &package, false).await.unwrap();

    let last = harness.controller.last(&app(), &job_type).await.unwrap().unwrap();
    assert_eq!(last.versions.target_platform, Version::new(8, 2, 0));

    // A major pin with no compatible version is refused.
    let pinned = ApplicationPackage::new(b"package".to_vec())
        .with_compile_version(Version::new(8, 1, 0))
        .with_major_version(9);
    let result = harness.controller.deploy(&app(), &job_type, None, &pinned, false).await;
    assert!(matches!(result, Err(JobError::Invalid { .. })), "got {result:?}");
}

#[tokio::test]
async fn history_eviction_keeps_success_and_first_failure() {
    let harness = harness_with(ControllerConfig {
        history_length: 3,
        ..ControllerConfig::default()
    });
    let job_type = JobType::production("us-east-1");

    for (build, succeed) in [(1, false), (2, true), (3, false), (4, false), (5, false)] {
        let id = start_run(&harness, &job_type, JobProfile::Production, build).await;
        harness
            .controller
            .log(&id, Step::DeployReal, LogType::Info, vec![format!("run {build}")])
            .await
            .unwrap();
        if succeed {
            run_to_completion(&harness, &id).await;
        } else {
            fail_and_complete(&harness, &id, Step::DeployReal, RunStatus::DeploymentFailed).await;
        }
    }

    let history = harness.controller.runs(&app(), &job_type).await.unwrap();
    assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    assert_eq!(history[&2].status, RunStatus::Success);

    // The evicted run's logs are gone; the retained ones still read.
    let evicted = RunId::new(app(), job_type.clone(), 1);
    assert!(harness.controller.details(&evicted, 0).await.unwrap().is_none());
    let kept = RunId::new(app(), job_type, 2);
    assert!(harness.controller.details(&kept, 0).await.unwrap().is_some());
}

#[tokio::test]
async fn platform_log_continuation_has_no_duplicates() {
    let harness = harness();
    let job_type = JobType::dev("us-east-1");
    let id = start_run(&harness, &job_type, JobProfile::Development, 1).await;

    harness.clock.advance(chrono::Duration::minutes(1));
    harness
        .controller
        .record_deployment(&app(), job_type.zone(), ApplicationVersion::from_build(1))
        .await
        .unwrap();

    let t0 = start_time() + chrono::Duration::minutes(2);
    let t1 = start_time() + chrono::Duration::minutes(3);
    let t2 = start_time() + chrono::Duration::minutes(4);
    let entry = |at: DateTime<Utc>, message: &str| LogEntry::new(at, LogType::Info, message);
    {
        let mut batches = harness.config_server.log_batches.lock().unwrap();
        batches.push_back(vec![entry(t0, "first"), entry(t1, "second")]);
        batches.push_back(vec![entry(t1, "second"), entry(t2, "third")]);
    }

    harness.controller.update_platform_log(&id).await.unwrap();
    harness.controller.update_platform_log(&id).await.unwrap();

    let log = harness.controller.details(&id, 0).await.unwrap().unwrap();
    let copied = &log.entries[&Step::CopyPlatformLogs];
    assert_eq!(copied.len(), 3);
    assert_eq!(copied.iter().map(|e| e.at).collect::<Vec<_>>(), vec![t0, t1, t2]);

    let run = harness.controller.last(&app(), &job_type).await.unwrap().unwrap();
    assert_eq!(run.last_platform_log_timestamp, t2);
}

#[tokio::test]
async fn test_log_and_report_collection() {
    let harness = harness();
    let job_type = JobType::SystemTest;
    let id = start_run(&harness, &job_type, JobProfile::SystemTest, 1).await;

    // Bring the run to the point where tests are finishing.
    for step in [Step::DeployTester, Step::InstallTester, Step::DeployReal, Step::InstallReal, Step::StartTests] {
        let locked = harness.controller.lock_step(&id.application, &id.job_type, step).await.unwrap();
        harness.controller.update(&id, RunStatus::Running, &locked).await.unwrap();
    }

    let at = start_time();
    {
        let mut entries = harness.tester_cloud.entries.lock().unwrap();
        *entries = vec![
            LogEntry {
                id: 7,
                at,
                entry_type: LogType::Info,
                message: "running tests".to_string(),
            },
            LogEntry {
                id: 8,
                at,
                entry_type: LogType::Info,
                message: "all green".to_string(),
            },
        ];
    }

    harness.controller.update_test_log(&id).await.unwrap();
    let run = harness.controller.last(&app(), &job_type).await.unwrap().unwrap();
    assert_eq!(run.last_test_log_entry, 8);

    // Nothing new: the cursor filters out everything already seen.
    harness.controller.update_test_log(&id).await.unwrap();
    let log = harness.controller.details(&id, 0).await.unwrap().unwrap();
    assert_eq!(log.entries[&Step::EndTests].len(), 2);

    *harness.tester_cloud.report.lock().unwrap() = Some(TestReport(serde_json::json!({"passed": 12, "failed": 0})));
    harness.controller.update_test_report(&id).await.unwrap();
    let reports = harness.controller.read_test_reports(&id).await.unwrap().unwrap();
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&reports).unwrap();
    assert_eq!(parsed.len(), 1);
}

#[tokio::test]
async fn garbage_collection_tolerates_partial_failure() {
    let harness = harness();
    // Two jobs with stored runs, for an application which is not registered.
    start_run(&harness, &JobType::SystemTest, JobProfile::SystemTest, 1).await;
    start_run(&harness, &JobType::StagingTest, JobProfile::StagingTest, 1).await;

    // Staging tester deactivation fails on the first sweep.
    harness.failing_staging(true);
    harness.controller.collect_garbage().await.unwrap();

    assert!(harness.controller.last(&app(), &JobType::SystemTest).await.unwrap().is_none());
    assert!(harness.controller.last(&app(), &JobType::StagingTest).await.unwrap().is_some());

    // The record survives, so the next sweep retries and completes.
    harness.failing_staging(false);
    harness.controller.collect_garbage().await.unwrap();

    assert!(harness.controller.last(&app(), &JobType::StagingTest).await.unwrap().is_none());
    let deactivated = harness.config_server.deactivated.lock().unwrap();
    assert!(deactivated.iter().any(|d| d.zone == JobType::SystemTest.zone()));
    assert!(deactivated.iter().any(|d| d.zone == JobType::StagingTest.zone()));
    assert!(deactivated.iter().all(|d| d.application.instance.as_str() == "default-t"));
}

#[tokio::test]
async fn run_numbers_increase_without_gaps() {
    let harness = harness();
    let job_type = JobType::production("us-east-1");
    for build in 1..=4 {
        let id = start_run(&harness, &job_type, JobProfile::Production, build).await;
        assert_eq!(id.number, build);
        run_to_completion(&harness, &id).await;
    }

    let runs = harness.controller.runs(&app(), &job_type).await.unwrap();
    assert_eq!(runs.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn finish_is_idempotent() {
    let harness = harness();
    let id = start_run(&harness, &JobType::SystemTest, JobProfile::SystemTest, 1).await;
    run_to_completion(&harness, &id).await;

    harness.controller.finish(&id).await.unwrap();

    assert_eq!(harness.metrics.finished.lock().unwrap().len(), 1);
    let history = harness.controller.runs(&app(), &JobType::SystemTest).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn finish_leaves_an_unfinished_healthy_run_untouched() {
    let harness = harness();
    let id = start_run(&harness, &JobType::SystemTest, JobProfile::SystemTest, 1).await;

    harness.controller.finish(&id).await.unwrap();

    let run = harness.controller.active(&id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(harness.metrics.finished.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_steps_map_to_terminal_statuses() {
    let harness = harness();
    let job_type = JobType::production("us-east-1");

    let id = start_run(&harness, &job_type, JobProfile::Production, 1).await;
    fail_and_complete(&harness, &id, Step::DeployReal, RunStatus::DeploymentFailed).await;
    assert_eq!(harness.controller.run(&id).await.unwrap().unwrap().status, RunStatus::DeploymentFailed);

    let job = JobId::new(app(), job_type.clone());
    assert_eq!(harness.controller.first_failing(&job).await.unwrap().unwrap().id.number, 1);
    assert!(harness.controller.last_success(&job).await.unwrap().is_none());

    let id = start_run(&harness, &job_type, JobProfile::Production, 2).await;
    run_to_completion(&harness, &id).await;
    assert_eq!(harness.controller.last_success(&job).await.unwrap().unwrap().id.number, 2);
    assert!(harness.controller.first_failing(&job).await.unwrap().is_none());
    assert_eq!(harness.controller.last_completed(&job).await.unwrap().unwrap().id.number, 2);
}

#[tokio::test]
async fn submit_assigns_builds_and_prunes_undeployed_revisions() {
    let harness = harness();
    let tenant_and_application = app().tenant_and_application();
    let package = |content: &str| ApplicationPackage::new(content.as_bytes().to_vec());

    let first = harness
        .controller
        .submit(&tenant_and_application, None, None, None, 42, &package("one"), b"tests-one")
        .await
        .unwrap();
    let second = harness
        .controller
        .submit(&tenant_and_application, None, None, None, 42, &package("two"), b"tests-two")
        .await
        .unwrap();
    assert_eq!((first.build, second.build), (1, 2));
    assert!(second.bundle_hash.is_some());

    // Deploy build 2 somewhere, then submit again: build 1 is pruned.
    harness
        .controller
        .record_deployment(&app(), JobType::production("us-east-1").zone(), second.clone())
        .await
        .unwrap();
    let third = harness
        .controller
        .submit(&tenant_and_application, None, None, None, 42, &package("three"), b"tests-three")
        .await
        .unwrap();
    assert_eq!(third.build, 3);

    assert_eq!(*harness.artifacts.pruned_at.lock().unwrap(), vec![2]);
    let record = ApplicationStore::new(Arc::clone(&harness.store))
        .read(&tenant_and_application)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.project_id, Some(42));
    let packaged: Vec<(u64, bool)> = record.revisions.iter().map(|v| (v.build, v.has_package)).collect();
    assert_eq!(packaged, vec![(1, false), (2, true), (3, true)]);
}

#[tokio::test]
async fn abort_of_missing_or_ended_runs_is_a_noop() {
    let harness = harness();
    let id = RunId::new(app(), JobType::SystemTest, 1);
    harness.controller.abort(&id, "nothing to do").await.unwrap();

    let id = start_run(&harness, &JobType::SystemTest, JobProfile::SystemTest, 1).await;
    run_to_completion(&harness, &id).await;
    harness.controller.abort(&id, "too late").await.unwrap();
    assert_eq!(harness.controller.run(&id).await.unwrap().unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn deployment_status_spans_jobs_of_the_application() {
    let harness = harness();
    let job_type = JobType::production("us-east-1");
    harness
        .controller
        .record_deployment(&app(), job_type.zone(), ApplicationVersion::from_build(1))
        .await
        .unwrap();
    let id = start_run(&harness, &job_type, JobProfile::Production, 1).await;
    run_to_completion(&harness, &id).await;

    let status = harness.controller.deployment_status(&app().tenant_and_application()).await.unwrap();
    assert_eq!(status.system_version, Some(Version::new(8, 2, 0)));
    assert_eq!(status.jobs.len(), 1);
    let job = status.job(&JobId::new(app(), job_type)).unwrap();
    assert!(!job.is_running());
    assert_eq!(job.last_success().unwrap().id.number, 1);
}

#[tokio::test]
async fn finish_resets_a_run_parked_in_reset() {
    let harness = harness();
    let job_type = JobType::production("us-east-1");
    let id = start_run(&harness, &job_type, JobProfile::Production, 1).await;

    {
        let locked = harness.controller.lock_step(&id.application, &id.job_type, Step::DeployReal).await.unwrap();
        harness.controller.update(&id, RunStatus::Reset, &locked).await.unwrap();
    }
    harness.controller.finish(&id).await.unwrap();

    let run = harness.controller.active(&id).await.unwrap().expect("run should restart, not end");
    assert_eq!(run.id.number, 1);
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.steps().values().all(|info| info.status == larch_deploy_core::StepStatus::Unfinished));

    let log = harness.controller.details(&id, 0).await.unwrap().unwrap();
    let messages: Vec<&str> = log.entries.values().flatten().map(|e| e.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.starts_with("### Run will reset")), "log: {messages:?}");
    assert!(harness.metrics.finished.lock().unwrap().is_empty());
}

#[tokio::test]
async fn finish_times_out_while_a_step_executor_holds_its_lock() {
    let harness = harness_with(ControllerConfig {
        step_lock_timeout: std::time::Duration::from_millis(50),
        ..ControllerConfig::default()
    });
    let job_type = JobType::production("us-east-1");
    let id = start_run(&harness, &job_type, JobProfile::Production, 1).await;

    let held = harness.controller.lock_step(&id.application, &id.job_type, Step::DeployReal).await.unwrap();
    let result = harness.controller.finish(&id).await;
    assert!(matches!(result, Err(JobError::Timeout { .. })), "got {result:?}");

    // Once the executor releases the step, finish proceeds.
    drop(held);
    harness.controller.finish(&id).await.unwrap();
}

impl Harness {
    fn failing_staging(&self, failing: bool) {
        let mut zones = self.config_server.failing_zones.lock().unwrap();
        if failing {
            zones.insert(JobType::StagingTest.zone().to_string());
        } else {
            zones.clear();
        }
    }
}
