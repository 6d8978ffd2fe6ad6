//! Minimal application registry.
//!
//! The controller needs a small amount of application state beside the runs
//! themselves: which instances exist, which revisions have been submitted
//! or dev-deployed, which revision is deployed where. One record per
//! application is stored at `/applications/{tenant}.{application}` and
//! mutated only under the application's lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use larch_core::KeyValueStore;
use larch_core::ReadRequest;
use larch_core::ScanRequest;
use larch_core::WriteRequest;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::ApplicationVersion;
use larch_deploy_core::InstanceName;
use larch_deploy_core::TenantAndApplicationId;
use larch_deploy_core::ZoneId;
use serde::Deserialize;
use serde::Serialize;

use crate::error::JobError;
use crate::error::Result;

/// Key prefix for application records.
const KV_PREFIX_APPLICATIONS: &str = "/applications/";

fn application_record_key(id: &TenantAndApplicationId) -> String {
    format!("{KV_PREFIX_APPLICATIONS}{id}")
}

/// A revision deployed to one zone of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// The zone deployed to.
    pub zone: ZoneId,
    /// The deployed revision.
    pub version: ApplicationVersion,
    /// When the deployment was last activated.
    pub at: DateTime<Utc>,
}

/// One instance of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Active deployments, keyed by zone.
    pub deployments: BTreeMap<String, Deployment>,
}

/// The registry record of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Identity of the application.
    pub id: TenantAndApplicationId,
    /// Build-system project id, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
    /// Instances of this application.
    pub instances: BTreeMap<InstanceName, Instance>,
    /// Known revisions, ascending by build number.
    pub revisions: Vec<ApplicationVersion>,
}

impl Application {
    /// A fresh record with no instances or revisions.
    pub fn new(id: TenantAndApplicationId) -> Self {
        Self {
            id,
            project_id: None,
            instances: BTreeMap::new(),
            revisions: Vec::new(),
        }
    }

    /// The newest known revision.
    pub fn latest_revision(&self) -> Option<&ApplicationVersion> {
        self.revisions.last()
    }

    /// Insert or replace a revision, keeping the list sorted by build.
    pub fn put_revision(&mut self, version: ApplicationVersion) {
        match self.revisions.binary_search_by_key(&version.build, |v| v.build) {
            Ok(index) => self.revisions[index] = version,
            Err(index) => self.revisions.insert(index, version),
        }
    }

    /// The oldest revision currently deployed to any zone, if any.
    pub fn oldest_deployed(&self) -> Option<ApplicationVersion> {
        self.instances
            .values()
            .flat_map(|instance| instance.deployments.values())
            .map(|deployment| deployment.version.clone())
            .min()
    }

    /// Record an activated deployment of an instance.
    pub fn put_deployment(&mut self, instance: &InstanceName, deployment: Deployment) {
        self.instances
            .entry(instance.clone())
            .or_default()
            .deployments
            .insert(deployment.zone.to_string(), deployment);
    }

    /// The deployment of an instance in a zone, if one is active.
    pub fn deployment(&self, instance: &InstanceName, zone: &ZoneId) -> Option<&Deployment> {
        self.instances.get(instance)?.deployments.get(&zone.to_string())
    }
}

/// Application record persistence.
pub struct ApplicationStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> ApplicationStore<S> {
    /// An application store over the given key-value store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Read an application record.
    pub async fn read(&self, id: &TenantAndApplicationId) -> Result<Option<Application>> {
        let key = application_record_key(id);
        let result = self.store.read(ReadRequest::new(key.clone())).await?;
        match result.kv {
            None => Ok(None),
            Some(kv) => serde_json::from_str(&kv.value).map(Some).map_err(|e| JobError::Storage {
                message: format!("corrupt application record at {key}: {e}"),
            }),
        }
    }

    /// Write an application record.
    pub async fn write(&self, application: &Application) -> Result<()> {
        let key = application_record_key(&application.id);
        let value = serde_json::to_string(application).map_err(|e| JobError::Storage {
            message: format!("failed to serialize application record at {key}: {e}"),
        })?;
        self.store.write(WriteRequest::set(key, value)).await?;
        Ok(())
    }

    /// All registered application instances.
    pub async fn instances(&self) -> Result<Vec<ApplicationId>> {
        let result = self.store.scan(ScanRequest::prefix(KV_PREFIX_APPLICATIONS)).await?;
        let mut instances = Vec::new();
        for entry in result.entries {
            let application: Application = serde_json::from_str(&entry.value).map_err(|e| JobError::Storage {
                message: format!("corrupt application record at {}: {e}", entry.key),
            })?;
            for name in application.instances.keys() {
                instances.push(application.id.instance(name.as_str()));
            }
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use larch_core::MemoryKeyValueStore;

    use super::*;

    fn record() -> Application {
        Application::new(TenantAndApplicationId::from_parts("t", "a"))
    }

    #[test]
    fn revisions_stay_sorted_and_deduplicated() {
        let mut application = record();
        application.put_revision(ApplicationVersion::from_build(2));
        application.put_revision(ApplicationVersion::from_build(1));
        application.put_revision(ApplicationVersion::from_build(2).without_package());

        let builds: Vec<u64> = application.revisions.iter().map(|v| v.build).collect();
        assert_eq!(builds, vec![1, 2]);
        assert!(!application.revisions[1].has_package);
        assert_eq!(application.latest_revision().unwrap().build, 2);
    }

    #[test]
    fn oldest_deployed_spans_instances() {
        let mut application = record();
        let at = Utc::now();
        for (instance, build, region) in [("default", 5, "us-east-1"), ("canary", 2, "eu-west-1")] {
            application.put_deployment(&InstanceName::new(instance), Deployment {
                zone: larch_deploy_core::JobType::production(region).zone(),
                version: ApplicationVersion::from_build(build),
                at,
            });
        }
        assert_eq!(application.oldest_deployed().unwrap().build, 2);
    }

    #[tokio::test]
    async fn records_round_trip_and_list_instances() {
        let store = ApplicationStore::new(MemoryKeyValueStore::new());
        let mut application = record();
        application.instances.insert(InstanceName::new("default"), Instance::default());
        application.instances.insert(InstanceName::new("canary"), Instance::default());
        store.write(&application).await.unwrap();

        let read = store.read(&application.id).await.unwrap().unwrap();
        assert_eq!(read, application);

        let instances = store.instances().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.contains(&application.id.instance("default")));
    }
}
