//! Resource radar.
//!
//! Each tick walks the configured pipelines and, per resource, performs one
//! version check under the resource's cluster-wide checking lock. Ticks are
//! idempotent; anything that goes wrong is either recorded on the resource
//! (check failures) or left for the next tick (conflicts, transient store
//! errors).

use crucible_core::abort;
use crucible_core::config::ResourceConfig;
use crucible_core::ports::{ConfigDb, Locker, NamedLock, VersionDb, WorkerPool};
use crucible_core::versions::Version;
use crucible_core::workers::{
    ContainerIdentifier, ContainerSpec, ContainerType, ResourceTypeContainerSpec,
};
use crucible_core::{Error, Result};
use crucible_resource::Resource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub struct Radar {
    locker: Arc<dyn Locker>,
    configs: Arc<dyn ConfigDb>,
    versions: Arc<dyn VersionDb>,
    pool: Arc<dyn WorkerPool>,
    interval: Duration,
}

impl Radar {
    pub fn new(
        locker: Arc<dyn Locker>,
        configs: Arc<dyn ConfigDb>,
        versions: Arc<dyn VersionDb>,
        pool: Arc<dyn WorkerPool>,
        interval: Duration,
    ) -> Self {
        Self {
            locker,
            configs,
            versions,
            pool,
            interval,
        }
    }

    /// Runs periodic scans until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "radar starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.scan_all().await {
                        warn!(error = %err, "radar scan failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("radar shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn scan_all(&self) -> Result<()> {
        for pipeline in self.configs.get_pipelines().await? {
            if pipeline.paused {
                continue;
            }

            let (config, _) = self.configs.get_config(&pipeline.name).await?;
            for resource in &config.resources {
                if let Err(err) = self.tick(&pipeline.name, resource).await {
                    warn!(
                        pipeline = pipeline.name,
                        resource = resource.name,
                        error = %err,
                        "resource check tick failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// One radar tick for one resource: take the checking lock, advance the
    /// version history, record or clear the check error.
    pub async fn tick(&self, pipeline: &str, resource: &ResourceConfig) -> Result<()> {
        let lock_name =
            NamedLock::resource_checking(&format!("{}:{}", pipeline, resource.name));

        let lock = match self
            .locker
            .acquire_write_lock_immediately(vec![lock_name])
            .await
        {
            Ok(lock) => lock,
            Err(Error::LockConflict) => {
                debug!(resource = resource.name, "check lock held elsewhere");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let result = self.check(resource).await;
        lock.release().await?;
        result
    }

    async fn check(&self, resource: &ResourceConfig) -> Result<()> {
        let saved = self.versions.get_resource(&resource.name).await?;
        if saved.paused {
            debug!(resource = resource.name, "resource is paused");
            return Ok(());
        }

        let from = match self
            .versions
            .get_latest_versioned_resource(&resource.name)
            .await
        {
            Ok(latest) => Some(latest.versioned_resource.version),
            Err(Error::NoVersions) => None,
            Err(err) => return Err(err),
        };

        match self.run_check(resource, from).await {
            Ok(new_versions) => {
                debug!(
                    resource = resource.name,
                    count = new_versions.len(),
                    "checked resource"
                );
                self.versions
                    .save_resource_versions(resource, &new_versions)
                    .await?;
                self.versions
                    .set_resource_check_error(&resource.name, None)
                    .await
            }
            Err(err) => {
                warn!(resource = resource.name, error = %err, "resource check failed");
                self.versions
                    .set_resource_check_error(&resource.name, Some(&err.to_string()))
                    .await
            }
        }
    }

    async fn run_check(
        &self,
        resource: &ResourceConfig,
        from: Option<Version>,
    ) -> Result<Vec<Version>> {
        let container = self
            .pool
            .create_container(
                &ContainerIdentifier {
                    container_type: Some(ContainerType::Check),
                    name: Some(resource.name.clone()),
                    check_type: Some(resource.resource_type.clone()),
                    check_source: Some(resource.source.clone()),
                    ..Default::default()
                },
                &ContainerSpec::ResourceType(ResourceTypeContainerSpec {
                    resource_type: resource.resource_type.clone(),
                    tags: vec![],
                    ephemeral: true,
                }),
            )
            .await?;

        let driver = Resource::new(container.into());
        let checked = driver
            .check(&resource.source, from.as_ref(), &mut abort::never())
            .await;

        if let Err(err) = driver.container().destroy().await {
            debug!(error = %err, "failed to destroy check container");
        }

        checked
    }
}
