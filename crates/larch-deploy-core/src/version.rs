//! Platform and application versions.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::package::SourceRevision;

/// A platform version triple, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}

impl Version {
    /// Build a version from its components.
    pub fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self { major, minor, micro }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let parse = |part: Option<&str>| {
            part.and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| format!("invalid version: {s:?}"))
        };
        let version = Self {
            major: parse(parts.next())?,
            minor: parse(parts.next())?,
            micro: parse(parts.next())?,
        };
        if parts.next().is_some() {
            return Err(format!("invalid version: {s:?}"));
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A numbered revision of an application's package, ordered by build number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationVersion {
    /// Strictly increasing build number per application, starting at 1.
    pub build: u64,
    /// Source revision the package was built from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRevision>,
    /// Email of the submitting author, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    /// Platform version the package was compiled against, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_version: Option<Version>,
    /// Build timestamp, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<DateTime<Utc>>,
    /// URL of the source repository view, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// True when the package was deployed directly to a zone, bypassing
    /// submission.
    #[serde(default)]
    pub deployed_directly: bool,
    /// Hash over the application and test packages, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    /// Whether the package bytes for this revision are still stored.
    #[serde(default = "default_true")]
    pub has_package: bool,
}

fn default_true() -> bool {
    true
}

impl ApplicationVersion {
    /// A bare revision with only a build number.
    pub fn from_build(build: u64) -> Self {
        debug_assert!(build > 0, "build numbers start at 1");
        Self {
            build,
            source: None,
            author_email: None,
            compile_version: None,
            build_time: None,
            source_url: None,
            deployed_directly: false,
            bundle_hash: None,
            has_package: true,
        }
    }

    /// This revision with the package bytes marked as pruned.
    pub fn without_package(mut self) -> Self {
        self.has_package = false;
        self
    }
}

impl PartialOrd for ApplicationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ApplicationVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.build.cmp(&other.build)
    }
}

impl fmt::Display for ApplicationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {}", self.build)
    }
}

/// The platform and application versions a run moves between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// Platform version to deploy.
    pub target_platform: Version,
    /// Application revision to deploy.
    pub target_application: ApplicationVersion,
    /// Platform version deployed before this run, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_platform: Option<Version>,
    /// Application revision deployed before this run, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_application: Option<ApplicationVersion>,
}

impl Versions {
    /// Target-only versions, with no known source.
    pub fn from_target(target_platform: Version, target_application: ApplicationVersion) -> Self {
        Self {
            target_platform,
            target_application,
            source_platform: None,
            source_application: None,
        }
    }
}
