//! Thin interfaces to the controller's collaborators.
//!
//! The controller never talks to a zone, a tester or an artifact repository
//! directly; everything external goes through the traits here. Production
//! wiring implements them against the real services, tests implement them
//! with scripted fakes. The [`ServiceRegistry`] bundles the handles so the
//! controller constructor stays small.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use larch_deploy_core::ApplicationName;
use larch_deploy_core::ApplicationPackage;
use larch_deploy_core::ApplicationVersion;
use larch_deploy_core::DeploymentId;
use larch_deploy_core::JobId;
use larch_deploy_core::LogEntry;
use larch_deploy_core::RunStatus;
use larch_deploy_core::TenantName;
use larch_deploy_core::TestReport;
use larch_deploy_core::Version;
use snafu::Snafu;

/// A failed collaborator call.
///
/// Collaborators carry their own deadlines; a failure here is transient
/// from the controller's point of view and changes no controller state.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct ExternalError {
    /// Description from the collaborator.
    pub message: String,
}

impl ExternalError {
    /// Wrap a collaborator failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of a collaborator call.
pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// The config server of a zone: deployment logs and deactivation.
#[async_trait]
pub trait ConfigServer: Send + Sync {
    /// Platform log entries for the deployment, from the given time.
    async fn get_logs(&self, deployment: &DeploymentId, from: DateTime<Utc>) -> ExternalResult<Vec<LogEntry>>;

    /// Remove the deployment from its zone.
    async fn deactivate(&self, deployment: &DeploymentId) -> ExternalResult<()>;
}

/// The tester cloud: test log entries and test reports.
#[async_trait]
pub trait TesterCloud: Send + Sync {
    /// Test log entries with ids greater than `after`.
    async fn get_log(&self, deployment: &DeploymentId, after: i64) -> ExternalResult<Vec<LogEntry>>;

    /// The test report for the deployment, once the tester has produced one.
    async fn get_test_report(&self, deployment: &DeploymentId) -> ExternalResult<Option<TestReport>>;
}

/// Durable storage for application packages, test packages and diffs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a submitted application package and its diff.
    async fn put(
        &self,
        tenant: &TenantName,
        application: &ApplicationName,
        version: &ApplicationVersion,
        package: &[u8],
        diff: &[u8],
    ) -> ExternalResult<()>;

    /// Store the test package of a submission.
    async fn put_tester(
        &self,
        tenant: &TenantName,
        application: &ApplicationName,
        version: &ApplicationVersion,
        test_package: &[u8],
    ) -> ExternalResult<()>;

    /// Store submission metadata.
    async fn put_meta(
        &self,
        tenant: &TenantName,
        application: &ApplicationName,
        at: DateTime<Utc>,
        metadata: &[u8],
    ) -> ExternalResult<()>;

    /// Store a directly-deployed package and its diff.
    async fn put_dev(
        &self,
        deployment: &DeploymentId,
        version: &ApplicationVersion,
        package: &[u8],
        diff: &[u8],
    ) -> ExternalResult<()>;

    /// Fetch the package bytes of a directly-deployed version.
    async fn get(&self, deployment: &DeploymentId, version: &ApplicationVersion) -> ExternalResult<Vec<u8>>;

    /// Find the package bytes of a submitted build, if still stored.
    async fn find(&self, tenant: &TenantName, application: &ApplicationName, build: u64) -> ExternalResult<Option<Vec<u8>>>;

    /// Remove submitted packages older than the oldest deployed version.
    async fn prune(
        &self,
        tenant: &TenantName,
        application: &ApplicationName,
        oldest_deployed: &ApplicationVersion,
    ) -> ExternalResult<()>;

    /// Remove test packages older than the oldest deployed version.
    async fn prune_testers(
        &self,
        tenant: &TenantName,
        application: &ApplicationName,
        oldest_deployed: &ApplicationVersion,
    ) -> ExternalResult<()>;

    /// Remove submission diffs for builds before the given one.
    async fn prune_diffs(&self, tenant: &TenantName, application: &ApplicationName, before_build: u64) -> ExternalResult<()>;

    /// Remove dev-deployment diffs for builds before the given one.
    async fn prune_dev_diffs(&self, deployment: &DeploymentId, before_build: u64) -> ExternalResult<()>;
}

/// Computes diffs between application packages.
///
/// The controller stores diffs next to packages but never inspects package
/// content itself.
pub trait PackageDiffer: Send + Sync {
    /// Diff `next` against `previous`.
    fn diff(&self, previous: &ApplicationPackage, next: &ApplicationPackage) -> Vec<u8>;

    /// Diff `next` against an empty package.
    fn diff_against_empty(&self, next: &ApplicationPackage) -> Vec<u8>;
}

/// The platform versions currently known to the system.
pub trait VersionStatus: Send + Sync {
    /// Deployable platform versions, in ascending order.
    fn deployable_versions(&self) -> Vec<Version>;

    /// Whether the given version is still an active deployment target.
    fn is_active(&self, version: &Version) -> bool;
}

/// Compatibility between platform versions and compile versions.
pub trait VersionCompatibility: Send + Sync {
    /// Whether a package compiled against `compile` may run on `platform`.
    fn accept(&self, platform: Version, compile: Version) -> bool;

    /// The negation of [`VersionCompatibility::accept`].
    fn refuse(&self, platform: Version, compile: Version) -> bool {
        !self.accept(platform, compile)
    }
}

/// The single source of time for the controller.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn instant(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn instant(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock advanced by hand, for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    /// A manual clock starting at the given instant.
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: StdMutex::new(start),
        })
    }

    /// Advance the clock.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn instant(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

/// Counters emitted by the controller.
pub trait JobMetrics: Send + Sync {
    /// A run was started.
    fn job_started(&self, job: &JobId);

    /// A run was finalized with the given status.
    fn job_finished(&self, job: &JobId, status: RunStatus);
}

/// Discards all metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl JobMetrics for NoopMetrics {
    fn job_started(&self, _job: &JobId) {}

    fn job_finished(&self, _job: &JobId, _status: RunStatus) {}
}

/// The collaborator handles a controller is wired with.
#[derive(Clone)]
pub struct ServiceRegistry {
    /// Config servers of the zones.
    pub config_server: Arc<dyn ConfigServer>,
    /// The tester cloud.
    pub tester_cloud: Arc<dyn TesterCloud>,
    /// Package and diff storage.
    pub artifact_store: Arc<dyn ArtifactStore>,
    /// Package diff computation.
    pub package_differ: Arc<dyn PackageDiffer>,
    /// Known platform versions.
    pub version_status: Arc<dyn VersionStatus>,
    /// Platform/compile version compatibility.
    pub version_compatibility: Arc<dyn VersionCompatibility>,
    /// Source of time.
    pub clock: Arc<dyn Clock>,
    /// Counter sink.
    pub metrics: Arc<dyn JobMetrics>,
}
