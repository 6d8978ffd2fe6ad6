//! Identifiers for tenants, applications, jobs and runs.
//!
//! Identifiers serialize as their display form (`tenant.app.instance`,
//! `production-us-east-1`, …) so they can double as path segments in the
//! store's key schema. Name segments therefore must not contain `.` or `/`.

use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw name. Segments must not contain `.` or `/`.
            pub fn new(name: impl Into<String>) -> Self {
                let name = name.into();
                debug_assert!(
                    !name.is_empty() && !name.contains('.') && !name.contains('/'),
                    "invalid name segment: {name:?}"
                );
                Self(name)
            }

            /// The raw string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type! {
    /// A tenant name.
    TenantName
}
name_type! {
    /// An application name within a tenant.
    ApplicationName
}
name_type! {
    /// An instance name within an application.
    InstanceName
}

/// Identifies one instance of a tenant application: `tenant.app.instance`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationId {
    /// Owning tenant.
    pub tenant: TenantName,
    /// Application within the tenant.
    pub application: ApplicationName,
    /// Instance within the application.
    pub instance: InstanceName,
}

impl ApplicationId {
    /// Build an id from its three name segments.
    pub fn from_parts(
        tenant: impl Into<String>,
        application: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            tenant: TenantName::new(tenant),
            application: ApplicationName::new(application),
            instance: InstanceName::new(instance),
        }
    }

    /// The tenant-and-application pair, without the instance.
    pub fn tenant_and_application(&self) -> TenantAndApplicationId {
        TenantAndApplicationId {
            tenant: self.tenant.clone(),
            application: self.application.clone(),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

impl FromStr for ApplicationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(a), Some(i), None) if !t.is_empty() && !a.is_empty() && !i.is_empty() => {
                Ok(Self::from_parts(t, a, i))
            }
            _ => Err(format!("invalid application id: {s:?}")),
        }
    }
}

impl Serialize for ApplicationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApplicationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A tenant and application, spanning all instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantAndApplicationId {
    /// Owning tenant.
    pub tenant: TenantName,
    /// Application within the tenant.
    pub application: ApplicationName,
}

impl TenantAndApplicationId {
    /// Build an id from its two name segments.
    pub fn from_parts(tenant: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            tenant: TenantName::new(tenant),
            application: ApplicationName::new(application),
        }
    }

    /// The id of the given instance of this application.
    pub fn instance(&self, instance: impl Into<String>) -> ApplicationId {
        ApplicationId {
            tenant: self.tenant.clone(),
            application: self.application.clone(),
            instance: InstanceName::new(instance),
        }
    }
}

impl fmt::Display for TenantAndApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenant, self.application)
    }
}

/// Deployment environments, ordered by distance from production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Automated system tests.
    Test,
    /// Staging verification against production-like state.
    Staging,
    /// Developer deployments.
    Dev,
    /// Performance test deployments.
    Perf,
    /// Production.
    Prod,
}

impl Environment {
    /// Lowercase name, as used in zone ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Dev => "dev",
            Self::Perf => "perf",
            Self::Prod => "prod",
        }
    }
}

/// A deployment zone: environment plus region.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    /// The environment of this zone.
    pub environment: Environment,
    /// The region of this zone.
    pub region: String,
}

impl ZoneId {
    /// Build a zone id.
    pub fn new(environment: Environment, region: impl Into<String>) -> Self {
        Self {
            environment,
            region: region.into(),
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.environment.as_str(), self.region)
    }
}

/// A named category of deployment job.
///
/// Each job type targets exactly one zone. The type universe is open-ended
/// (one production, verification-test, dev and perf job per region), so
/// types are enumerated from stored run data rather than from a static
/// list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobType {
    /// Functional tests against a fresh deployment in the test environment.
    SystemTest,
    /// Upgrade verification against production-like state.
    StagingTest,
    /// Production deployment to a region.
    Production {
        /// Target region.
        region: String,
    },
    /// Verification tests against the production deployment in a region.
    Test {
        /// Target region.
        region: String,
    },
    /// Developer deployment to a region.
    Dev {
        /// Target region.
        region: String,
    },
    /// Performance test deployment to a region.
    Perf {
        /// Target region.
        region: String,
    },
}

impl JobType {
    /// A production job for the given region.
    pub fn production(region: impl Into<String>) -> Self {
        Self::Production { region: region.into() }
    }

    /// A production verification test job for the given region.
    pub fn test(region: impl Into<String>) -> Self {
        Self::Test { region: region.into() }
    }

    /// A developer job for the given region.
    pub fn dev(region: impl Into<String>) -> Self {
        Self::Dev { region: region.into() }
    }

    /// A performance test job for the given region.
    pub fn perf(region: impl Into<String>) -> Self {
        Self::Perf { region: region.into() }
    }

    /// The job name, used in the store's key schema.
    pub fn job_name(&self) -> String {
        match self {
            Self::SystemTest => "system-test".to_string(),
            Self::StagingTest => "staging-test".to_string(),
            Self::Production { region } => format!("production-{region}"),
            Self::Test { region } => format!("test-{region}"),
            Self::Dev { region } => format!("dev-{region}"),
            Self::Perf { region } => format!("perf-{region}"),
        }
    }

    /// Parse a job name back into a type.
    pub fn from_job_name(name: &str) -> Option<Self> {
        match name {
            "system-test" => Some(Self::SystemTest),
            "staging-test" => Some(Self::StagingTest),
            _ => {
                if let Some(region) = name.strip_prefix("production-") {
                    (!region.is_empty()).then(|| Self::production(region))
                } else if let Some(region) = name.strip_prefix("test-") {
                    (!region.is_empty()).then(|| Self::test(region))
                } else if let Some(region) = name.strip_prefix("dev-") {
                    (!region.is_empty()).then(|| Self::dev(region))
                } else if let Some(region) = name.strip_prefix("perf-") {
                    (!region.is_empty()).then(|| Self::perf(region))
                } else {
                    None
                }
            }
        }
    }

    /// The zone this job type deploys to. Verification tests run against
    /// the production deployment, so their zone is the production zone.
    pub fn zone(&self) -> ZoneId {
        match self {
            Self::SystemTest => ZoneId::new(Environment::Test, "default"),
            Self::StagingTest => ZoneId::new(Environment::Staging, "default"),
            Self::Production { region } | Self::Test { region } => ZoneId::new(Environment::Prod, region.clone()),
            Self::Dev { region } => ZoneId::new(Environment::Dev, region.clone()),
            Self::Perf { region } => ZoneId::new(Environment::Perf, region.clone()),
        }
    }

    /// True for production deployment jobs.
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production { .. })
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_name())
    }
}

impl Serialize for JobType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.job_name())
    }
}

impl<'de> Deserialize<'de> for JobType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_job_name(&s).ok_or_else(|| de::Error::custom(format!("unknown job name: {s:?}")))
    }
}

/// An application and a job type: the key under which runs are numbered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    /// The application the job runs for.
    pub application: ApplicationId,
    /// The kind of job.
    pub job_type: JobType,
}

impl JobId {
    /// Build a job id.
    pub fn new(application: ApplicationId, job_type: JobType) -> Self {
        Self { application, job_type }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.job_type, self.application)
    }
}

/// One numbered run of a job.
///
/// Numbers are strictly increasing positive integers per job; equality and
/// ordering are by number within a fixed job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    /// The application the run is for.
    pub application: ApplicationId,
    /// The kind of job.
    pub job_type: JobType,
    /// Strictly increasing run number, starting at 1.
    pub number: u64,
}

impl RunId {
    /// Build a run id.
    pub fn new(application: ApplicationId, job_type: JobType, number: u64) -> Self {
        debug_assert!(number > 0, "run numbers start at 1");
        Self {
            application,
            job_type,
            number,
        }
    }

    /// The job this run belongs to.
    pub fn job(&self) -> JobId {
        JobId::new(self.application.clone(), self.job_type.clone())
    }

    /// The tester application id for this run.
    pub fn tester(&self) -> TesterId {
        TesterId::of(&self.application)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} of {} for {}", self.number, self.job_type, self.application)
    }
}

/// The instance id of the tester application paired with a real application.
///
/// Tester ids live in the same namespace as real applications but must not
/// be used as such.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TesterId(ApplicationId);

/// Suffix appended to the real instance name to form the tester instance.
const TESTER_SUFFIX: &str = "-t";

impl TesterId {
    /// The tester id paired with the given application.
    pub fn of(id: &ApplicationId) -> Self {
        Self(ApplicationId {
            tenant: id.tenant.clone(),
            application: id.application.clone(),
            instance: InstanceName::new(format!("{}{}", id.instance, TESTER_SUFFIX)),
        })
    }

    /// The underlying application id of the tester.
    pub fn id(&self) -> &ApplicationId {
        &self.0
    }
}

impl fmt::Display for TesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An application deployed to a zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId {
    /// The deployed application.
    pub application: ApplicationId,
    /// The zone it is deployed in.
    pub zone: ZoneId,
}

impl DeploymentId {
    /// Build a deployment id.
    pub fn new(application: ApplicationId, zone: ZoneId) -> Self {
        Self { application, zone }
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.application, self.zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_round_trips_through_display() {
        let id = ApplicationId::from_parts("tenant", "app", "default");
        let parsed: ApplicationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_application_ids_are_rejected() {
        assert!("tenant.app".parse::<ApplicationId>().is_err());
        assert!("tenant.app.default.extra".parse::<ApplicationId>().is_err());
        assert!("..".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn job_names_round_trip() {
        for job_type in [
            JobType::SystemTest,
            JobType::StagingTest,
            JobType::production("us-east-1"),
            JobType::test("us-east-1"),
            JobType::dev("eu-west-3"),
            JobType::perf("ap-south-2"),
        ] {
            assert_eq!(JobType::from_job_name(&job_type.job_name()), Some(job_type));
        }
        assert_eq!(JobType::from_job_name("production-"), None);
        assert_eq!(JobType::from_job_name("bogus"), None);
    }

    #[test]
    fn run_ids_order_by_number() {
        let app = ApplicationId::from_parts("t", "a", "i");
        let a = RunId::new(app.clone(), JobType::SystemTest, 1);
        let b = RunId::new(app, JobType::SystemTest, 2);
        assert!(a < b);
    }

    #[test]
    fn tester_id_appends_suffix() {
        let id = ApplicationId::from_parts("t", "a", "default");
        assert_eq!(TesterId::of(&id).id().instance.as_str(), "default-t");
    }
}
