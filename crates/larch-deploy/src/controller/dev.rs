//! Developer deployment and package submission.
//!
//! `deploy` is the interactive path: store a package, replace whatever run
//! is in flight, and start a development run against a suitable platform
//! version. `submit` is the build-system path: accept an application and
//! test package pair, assign the next build number, persist the diff, and
//! prune revisions nothing deploys anymore.

use larch_core::KeyValueStore;
use larch_deploy_core::ApplicationId;
use larch_deploy_core::ApplicationPackage;
use larch_deploy_core::ApplicationVersion;
use larch_deploy_core::DeploymentId;
use larch_deploy_core::JobProfile;
use larch_deploy_core::JobType;
use larch_deploy_core::Run;
use larch_deploy_core::SourceRevision;
use larch_deploy_core::TenantAndApplicationId;
use larch_deploy_core::Version;
use larch_deploy_core::Versions;
use tracing::info;

use super::external;
use super::JobController;
use crate::apps::Application;
use crate::error::JobError;
use crate::error::Result;
use crate::lock;

impl<S: KeyValueStore + ?Sized> JobController<S> {
    /// Store the given package and start a development run of it, aborting
    /// and waiting out any ongoing run of the job first.
    pub async fn deploy(
        &self,
        id: &ApplicationId,
        job_type: &JobType,
        platform: Option<Version>,
        package: &ApplicationPackage,
        dry_run: bool,
    ) -> Result<()> {
        if !matches!(job_type, JobType::Dev { .. } | JobType::Perf { .. }) {
            return Err(JobError::Invalid {
                reason: format!("direct deployment is only possible to dev and perf zones, not {job_type}"),
            });
        }

        let tenant_and_application = id.tenant_and_application();
        {
            let _guard = self.locks.lock(lock::application_key(&tenant_and_application)).await?;
            let mut record = self
                .applications
                .read(&tenant_and_application)
                .await?
                .unwrap_or_else(|| Application::new(tenant_and_application.clone()));
            record.instances.entry(id.instance.clone()).or_default();
            self.applications.write(&record).await?;
        }

        let deployment = DeploymentId::new(id.clone(), job_type.zone());
        let last_run = self.last(id, job_type).await?;
        if let Some(active) = last_run.as_ref().filter(|run| !run.has_ended()) {
            self.abort_and_wait(&active.id).await?;
        }

        let build = last_run.as_ref().map(|run| run.versions.target_application.build).unwrap_or(0) + 1;
        let mut version = ApplicationVersion::from_build(build);
        version.compile_version = package.compile_version();
        version.build_time = package.build_time();
        version.deployed_directly = true;

        let diff = self.dev_diff(&deployment, &last_run, package).await;

        {
            let _guard = self.locks.lock(lock::application_key(&tenant_and_application)).await?;
            self.services
                .artifact_store
                .put_dev(&deployment, &version, package.content(), &diff)
                .await
                .map_err(|e| external("artifact store", e))?;

            let target_platform = match platform {
                Some(platform) => platform,
                None => self.find_target_platform(package, &last_run)?,
            };
            let versions = Versions {
                target_platform,
                target_application: version.clone(),
                source_platform: last_run.as_ref().map(|run| run.versions.target_platform),
                source_application: last_run.as_ref().map(|run| run.versions.target_application.clone()),
            };
            let profile = if dry_run {
                JobProfile::DevelopmentDryRun
            } else {
                JobProfile::Development
            };
            self.start(id, job_type, versions, false, profile, None).await?;

            let mut record = self
                .applications
                .read(&tenant_and_application)
                .await?
                .unwrap_or_else(|| Application::new(tenant_and_application.clone()));
            record.put_revision(version);
            self.applications.write(&record).await?;
        }

        let last = self.last(id, job_type).await?.ok_or_else(|| JobError::NotFound {
            what: format!("last run of {job_type} for {id}"),
        })?;
        self.run_step(last).await;
        Ok(())
    }

    /// Diff against the previous dev-deployed package, or against the
    /// empty package when there is none or its bytes are gone.
    async fn dev_diff(&self, deployment: &DeploymentId, last_run: &Option<Run>, package: &ApplicationPackage) -> Vec<u8> {
        let differ = &self.services.package_differ;
        match last_run.as_ref().map(|run| run.versions.target_application.clone()) {
            Some(previous) => match self.services.artifact_store.get(deployment, &previous).await {
                Ok(bytes) => differ.diff(&ApplicationPackage::new(bytes), package),
                Err(_) => differ.diff_against_empty(package),
            },
            None => differ.diff_against_empty(package),
        }
    }

    /// The platform version to deploy a package against.
    ///
    /// A declared major pins the choice to the newest compatible version on
    /// that major. Otherwise the previous platform is kept while it is
    /// still active and compatible, and the newest compatible deployable
    /// version is used as the fallback.
    fn find_target_platform(&self, package: &ApplicationPackage, last_run: &Option<Run>) -> Result<Version> {
        let compatibility = &self.services.version_compatibility;
        let versions = self.services.version_status.deployable_versions();

        if let Some(major) = package.major_version() {
            return versions
                .iter()
                .rev()
                .filter(|version| version.major == major)
                .find(|version| compatibility.accept(**version, package.compile_version().unwrap_or(**version)))
                .copied()
                .ok_or_else(|| JobError::Invalid {
                    reason: format!("major {major} specified in the deployment spec, but no version on that major was found"),
                });
        }

        if let Some(previous) = last_run.as_ref().map(|run| run.versions.target_platform) {
            if self.services.version_status.is_active(&previous)
                && compatibility.accept(previous, package.compile_version().unwrap_or(previous))
            {
                return Ok(previous);
            }
        }

        versions
            .into_iter()
            .rev()
            .find(|platform| compatibility.accept(*platform, package.compile_version().unwrap_or(*platform)))
            .ok_or_else(|| JobError::Invalid {
                reason: match package.compile_version() {
                    Some(compile) => format!("no suitable platform version found for package compiled against {compile}"),
                    None => "no suitable platform version found".to_string(),
                },
            })
    }

    /// Accept and store a new application and test package pair under the
    /// next build number, and prune revisions older than the oldest
    /// deployed one.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        id: &TenantAndApplicationId,
        source: Option<SourceRevision>,
        author_email: Option<String>,
        source_url: Option<String>,
        project_id: u64,
        package: &ApplicationPackage,
        test_package: &[u8],
    ) -> Result<ApplicationVersion> {
        let _guard = self.locks.lock(lock::application_key(id)).await?;
        let mut record = self.applications.read(id).await?.unwrap_or_else(|| Application::new(id.clone()));

        let previous = record.latest_revision().cloned();
        let previous_package = match &previous {
            Some(previous) => self
                .services
                .artifact_store
                .find(&id.tenant, &id.application, previous.build)
                .await
                .map_err(|e| external("artifact store", e))?
                .map(ApplicationPackage::new),
            None => None,
        };

        let build = previous.map(|version| version.build).unwrap_or(0) + 1;
        let mut version = ApplicationVersion::from_build(build);
        version.source = source;
        version.author_email = author_email;
        version.compile_version = package.compile_version();
        version.build_time = package.build_time();
        version.source_url = source_url;
        version.bundle_hash = Some(package.hash_pair(test_package));

        let differ = &self.services.package_differ;
        let diff = match previous_package {
            Some(previous) => differ.diff(&previous, package),
            None => differ.diff_against_empty(package),
        };

        let artifacts = &self.services.artifact_store;
        artifacts
            .put(&id.tenant, &id.application, &version, package.content(), &diff)
            .await
            .map_err(|e| external("artifact store", e))?;
        artifacts
            .put_tester(&id.tenant, &id.application, &version, test_package)
            .await
            .map_err(|e| external("artifact store", e))?;
        let metadata = serde_json::to_vec(&version).map_err(|e| JobError::Storage {
            message: format!("failed to serialize submission metadata: {e}"),
        })?;
        artifacts
            .put_meta(&id.tenant, &id.application, self.now(), &metadata)
            .await
            .map_err(|e| external("artifact store", e))?;

        record.project_id = Some(project_id);
        record.put_revision(version.clone());
        self.prune_revisions(&mut record).await?;
        self.applications.write(&record).await?;

        info!(application = %id, build, "accepted submitted package");
        Ok(version)
    }

    /// Drop stored packages of revisions older than the oldest deployed
    /// one; their bytes can no longer be needed.
    async fn prune_revisions(&self, record: &mut Application) -> Result<()> {
        let Some(oldest_deployed) = record.oldest_deployed() else {
            return Ok(());
        };
        let artifacts = &self.services.artifact_store;
        artifacts
            .prune(&record.id.tenant, &record.id.application, &oldest_deployed)
            .await
            .map_err(|e| external("artifact store", e))?;
        artifacts
            .prune_testers(&record.id.tenant, &record.id.application, &oldest_deployed)
            .await
            .map_err(|e| external("artifact store", e))?;
        for revision in &mut record.revisions {
            if revision.build < oldest_deployed.build && revision.has_package {
                *revision = revision.clone().without_package();
            }
        }
        Ok(())
    }
}
