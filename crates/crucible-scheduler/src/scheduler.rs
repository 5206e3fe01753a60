//! Per-job scheduling decisions.

use crate::factory::BuildFactory;
use crucible_core::config::{JobConfig, ResourceConfig};
use crucible_core::ports::{BuildDb, VersionDb};
use crucible_core::versions::BuildInput;
use crucible_core::{Error, Result};
use crucible_engine::Engine;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Scheduler {
    builds: Arc<dyn BuildDb>,
    versions: Arc<dyn VersionDb>,
    factory: BuildFactory,
    engine: Arc<dyn Engine>,
}

impl Scheduler {
    pub fn new(
        builds: Arc<dyn BuildDb>,
        versions: Arc<dyn VersionDb>,
        factory: BuildFactory,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            builds,
            versions,
            factory,
            engine,
        }
    }

    /// Creates a pending build for the latest jointly-consistent input
    /// versions, unless a build with exactly those inputs already exists.
    pub async fn build_latest_inputs(&self, job: &JobConfig) -> Result<()> {
        let inputs = job.inputs();
        if inputs.is_empty() {
            return Ok(());
        }
        if !inputs.iter().any(|input| input.trigger) {
            debug!(job = job.name, "no triggering inputs");
            return Ok(());
        }

        let latest = match self.versions.get_latest_input_versions(&inputs).await {
            Ok(latest) => latest,
            Err(Error::NoVersions) => {
                debug!(job = job.name, "no satisfiable input versions");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let build_inputs: Vec<BuildInput> = inputs
            .iter()
            .zip(latest)
            .map(|(input, saved)| BuildInput {
                name: input.name.clone(),
                versioned_resource: saved.versioned_resource,
            })
            .collect();

        match self
            .builds
            .get_job_build_for_inputs(&job.name, &build_inputs)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::NoBuild) => {
                let build = self
                    .builds
                    .create_job_build_with_inputs(&job.name, &build_inputs)
                    .await?;
                info!(job = job.name, build = %build.id, "created build for new inputs");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Moves the job's oldest pending build into the engine, if the serial
    /// policy allows it. An abort that lands before the build starts wins.
    pub async fn try_next_pending_build(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> Result<()> {
        let (build, inputs) = match self.builds.get_next_pending_build(&job.name).await {
            Ok(next) => next,
            Err(Error::NoBuild) => return Ok(()),
            Err(err) => return Err(err),
        };

        if !self.builds.schedule_build(build.id, job.serial).await? {
            debug!(job = job.name, build = %build.id, "build not schedulable");
            return Ok(());
        }

        let plan = self.factory.create(job, resources, &inputs)?;
        let running = self.engine.create_build(&build, &plan).await?;
        let metadata = running.metadata()?;

        if !self
            .builds
            .start_build(build.id, self.engine.name(), &metadata)
            .await?
        {
            info!(job = job.name, build = %build.id, "build aborted before starting");
            return Ok(());
        }

        info!(job = job.name, build = %build.id, "starting build");
        tokio::spawn(async move { running.resume().await });
        Ok(())
    }
}
