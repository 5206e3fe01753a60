//! Get and put steps.

use crate::delegate::BuildDelegate;
use crate::step::{Artifact, Step, StepContext, StepOutcome};
use async_trait::async_trait;
use crucible_core::events::{Origin, OriginLocation, OriginSource, StepType};
use crucible_core::ids::BuildId;
use crucible_core::plan::{GetPlan, PutPlan};
use crucible_core::ports::{Container, VersionDb, WorkerPool};
use crucible_core::workers::{
    ContainerIdentifier, ContainerSpec, ContainerType, ResourceTypeContainerSpec,
};
use crucible_core::{Error, Result};
use crucible_resource::{Resource, GET_DIR, PUT_DIR};
use std::sync::Arc;

pub struct GetStep {
    pub plan: GetPlan,
    pub build_id: BuildId,
    pub pipeline_name: Option<String>,
    pub location: OriginLocation,
    pub pool: Arc<dyn WorkerPool>,
    pub versions: Arc<dyn VersionDb>,
    pub delegate: Arc<dyn BuildDelegate>,
}

impl GetStep {
    fn origin(&self, source: OriginSource) -> Origin {
        Origin {
            step_type: StepType::Get,
            name: self.plan.name.clone(),
            source,
            location: self.location,
        }
    }
}

#[async_trait]
impl Step for GetStep {
    async fn run(self: Box<Self>, mut ctx: StepContext) -> Result<StepOutcome> {
        // A put earlier in the plan determines what its dependent get
        // fetches; otherwise the scheduler pinned a version, or we take
        // whatever is latest.
        let version = match &self.plan.version {
            Some(version) => version.clone(),
            None => match ctx.artifacts.produced(&self.plan.resource).await {
                Some(version) => version,
                None => {
                    self.versions
                        .get_latest_versioned_resource(&self.plan.resource)
                        .await?
                        .versioned_resource
                        .version
                }
            },
        };

        // Operators disable versions to keep them out of builds; honour
        // that even for a build scheduled before the version was disabled.
        if !self
            .versions
            .version_enabled(&self.plan.resource, &version)
            .await?
        {
            self.delegate
                .error(
                    Some(self.origin(OriginSource::Stderr)),
                    &format!(
                        "input {} refers to a disabled version of {}",
                        self.plan.name, self.plan.resource
                    ),
                )
                .await;
            return Err(Error::DisabledVersion {
                input: self.plan.name.clone(),
            });
        }

        let container: Arc<dyn Container> = self
            .pool
            .create_container(
                &ContainerIdentifier {
                    container_type: Some(ContainerType::Get),
                    name: Some(self.plan.name.clone()),
                    pipeline_name: self.pipeline_name.clone(),
                    build_id: Some(self.build_id),
                    step_location: Some(self.location.id),
                    ..Default::default()
                },
                &ContainerSpec::ResourceType(ResourceTypeContainerSpec {
                    resource_type: self.plan.resource_type.clone(),
                    tags: self.plan.tags.clone(),
                    ephemeral: false,
                }),
            )
            .await?
            .into();

        let driver = Resource::new(container.clone());
        let fetched = driver
            .get(&self.plan.source, &self.plan.params, &version, &mut ctx.abort)
            .await;

        match fetched {
            Ok((result, logs)) => {
                self.delegate
                    .log(self.origin(OriginSource::Stderr), &logs)
                    .await;
                self.delegate
                    .input_received(
                        self.origin(OriginSource::Stdout),
                        &self.plan,
                        &result.version,
                        &result.metadata,
                    )
                    .await;
                ctx.artifacts
                    .register(&self.plan.name, Artifact::new(container, GET_DIR))
                    .await;
                Ok(StepOutcome::new(true))
            }
            Err(Error::ScriptFailed { status, stderr }) => {
                self.delegate
                    .log(self.origin(OriginSource::Stderr), &stderr)
                    .await;
                self.delegate
                    .finish_step(self.origin(OriginSource::Stdout), status)
                    .await;
                container.release();
                Ok(StepOutcome::new(false))
            }
            Err(err) => {
                container.release();
                Err(err)
            }
        }
    }
}

pub struct PutStep {
    pub plan: PutPlan,
    pub build_id: BuildId,
    pub pipeline_name: Option<String>,
    pub location: OriginLocation,
    pub pool: Arc<dyn WorkerPool>,
    pub delegate: Arc<dyn BuildDelegate>,
}

impl PutStep {
    fn origin(&self, source: OriginSource) -> Origin {
        Origin {
            step_type: StepType::Put,
            name: self.plan.name.clone(),
            source,
            location: self.location,
        }
    }
}

#[async_trait]
impl Step for PutStep {
    async fn run(self: Box<Self>, mut ctx: StepContext) -> Result<StepOutcome> {
        let container: Arc<dyn Container> = self
            .pool
            .create_container(
                &ContainerIdentifier {
                    container_type: Some(ContainerType::Put),
                    name: Some(self.plan.name.clone()),
                    pipeline_name: self.pipeline_name.clone(),
                    build_id: Some(self.build_id),
                    step_location: Some(self.location.id),
                    ..Default::default()
                },
                &ContainerSpec::ResourceType(ResourceTypeContainerSpec {
                    resource_type: self.plan.resource_type.clone(),
                    tags: self.plan.tags.clone(),
                    ephemeral: false,
                }),
            )
            .await?
            .into();

        // The out script sees the whole working tree.
        for (name, artifact) in ctx.artifacts.all().await {
            artifact
                .stream_to(container.as_ref(), &format!("{PUT_DIR}/{name}"))
                .await?;
        }

        let driver = Resource::new(container.clone());
        let produced = driver
            .put(&self.plan.source, &self.plan.params, &mut ctx.abort)
            .await;

        match produced {
            Ok((result, logs)) => {
                self.delegate
                    .log(self.origin(OriginSource::Stderr), &logs)
                    .await;
                self.delegate
                    .output_produced(
                        self.origin(OriginSource::Stdout),
                        &self.plan,
                        &result.version,
                        &result.metadata,
                    )
                    .await;
                ctx.artifacts
                    .record_produced(&self.plan.resource, result.version)
                    .await;
                container.release();
                Ok(StepOutcome::new(true))
            }
            Err(Error::ScriptFailed { status, stderr }) => {
                self.delegate
                    .log(self.origin(OriginSource::Stderr), &stderr)
                    .await;
                self.delegate
                    .finish_step(self.origin(OriginSource::Stdout), status)
                    .await;
                container.release();
                Ok(StepOutcome::new(false))
            }
            Err(err) => {
                container.release();
                Err(err)
            }
        }
    }
}
