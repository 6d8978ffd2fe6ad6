//! Application packages and source revisions.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::version::Version;

/// The version-control revision an application package was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    /// Repository URL.
    pub repository: String,
    /// Branch name.
    pub branch: String,
    /// Commit hash.
    pub commit: String,
}

/// An application package: opaque zipped content plus declared metadata.
///
/// The controller never inspects the content; diffs are delegated to a
/// collaborator and storage to the artifact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPackage {
    content: Vec<u8>,
    compile_version: Option<Version>,
    build_time: Option<DateTime<Utc>>,
    major_version: Option<u64>,
}

impl ApplicationPackage {
    /// Wrap package bytes with no declared metadata.
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            compile_version: None,
            build_time: None,
            major_version: None,
        }
    }

    /// This package with a declared compile version.
    pub fn with_compile_version(mut self, version: Version) -> Self {
        self.compile_version = Some(version);
        self
    }

    /// This package with a declared build time.
    pub fn with_build_time(mut self, at: DateTime<Utc>) -> Self {
        self.build_time = Some(at);
        self
    }

    /// This package pinned to a platform major version.
    pub fn with_major_version(mut self, major: u64) -> Self {
        self.major_version = Some(major);
        self
    }

    /// The zipped package content.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The platform version this package was compiled against, if declared.
    pub fn compile_version(&self) -> Option<Version> {
        self.compile_version
    }

    /// When this package was built, if declared.
    pub fn build_time(&self) -> Option<DateTime<Utc>> {
        self.build_time
    }

    /// The platform major this package is pinned to, if declared.
    pub fn major_version(&self) -> Option<u64> {
        self.major_version
    }

    /// Content hash of this package.
    pub fn bundle_hash(&self) -> String {
        blake3::hash(&self.content).to_hex().to_string()
    }

    /// Combined hash of an application package and its test package.
    pub fn hash_pair(&self, test_package: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.content);
        hasher.update(test_package);
        hasher.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_hash_is_stable_and_content_sensitive() {
        let a = ApplicationPackage::new(b"package".to_vec());
        let b = ApplicationPackage::new(b"package".to_vec());
        let c = ApplicationPackage::new(b"other".to_vec());
        assert_eq!(a.bundle_hash(), b.bundle_hash());
        assert_ne!(a.bundle_hash(), c.bundle_hash());
    }

    #[test]
    fn pair_hash_covers_the_test_package() {
        let package = ApplicationPackage::new(b"package".to_vec());
        assert_ne!(package.hash_pair(b"tests-1"), package.hash_pair(b"tests-2"));
    }
}
