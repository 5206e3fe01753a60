//! Task steps.

use crate::delegate::BuildDelegate;
use crate::step::{Artifact, Step, StepContext, StepOutcome};
use async_trait::async_trait;
use crucible_core::abort;
use crucible_core::config::TaskConfig;
use crucible_core::events::{Origin, OriginLocation, OriginSource, StepType};
use crucible_core::ids::BuildId;
use crucible_core::plan::TaskPlan;
use crucible_core::ports::{Container, ProcessSpec, WorkerPool};
use crucible_core::workers::{
    ContainerIdentifier, ContainerSpec, ContainerType, TaskContainerSpec,
};
use crucible_core::{Error, Result};
use std::sync::Arc;

const TASK_DIR: &str = "/tmp/build";

pub struct TaskStep {
    pub plan: TaskPlan,
    pub build_id: BuildId,
    pub pipeline_name: Option<String>,
    pub location: OriginLocation,
    pub pool: Arc<dyn WorkerPool>,
    pub delegate: Arc<dyn BuildDelegate>,
}

impl TaskStep {
    fn origin(&self, source: OriginSource) -> Origin {
        Origin {
            step_type: StepType::Task,
            name: self.plan.name.clone(),
            source,
            location: self.location,
        }
    }

    /// Resolves the task's config: a file from the working tree, an inline
    /// config, or the file with the inline config overlaid.
    async fn resolve_config(&self, ctx: &StepContext) -> Result<TaskConfig> {
        let from_path = match &self.plan.config_path {
            Some(path) => {
                let (artifact_name, file) = path.split_once('/').ok_or_else(|| {
                    Error::MissingTaskConfig(format!(
                        "config path {path} does not name an input"
                    ))
                })?;
                let artifact = ctx
                    .artifacts
                    .get(artifact_name)
                    .await
                    .ok_or_else(|| Error::UnknownArtifactSource(artifact_name.to_string()))?;
                let raw = artifact.read_file(file).await?;
                Some(serde_json::from_slice::<TaskConfig>(&raw)?)
            }
            None => None,
        };

        match (from_path, &self.plan.config) {
            (Some(file), Some(inline)) => Ok(file.merged(inline.clone())),
            (Some(file), None) => Ok(file),
            (None, Some(inline)) => Ok(inline.clone()),
            (None, None) => Err(Error::MissingTaskConfig(self.plan.name.clone())),
        }
    }
}

#[async_trait]
impl Step for TaskStep {
    async fn run(self: Box<Self>, mut ctx: StepContext) -> Result<StepOutcome> {
        let config = self.resolve_config(&ctx).await?;

        let container: Arc<dyn Container> = self
            .pool
            .create_container(
                &ContainerIdentifier {
                    container_type: Some(ContainerType::Task),
                    name: Some(self.plan.name.clone()),
                    pipeline_name: self.pipeline_name.clone(),
                    build_id: Some(self.build_id),
                    step_location: Some(self.location.id),
                    ..Default::default()
                },
                &ContainerSpec::Task(TaskContainerSpec {
                    platform: config.platform.clone(),
                    tags: self.plan.tags.clone(),
                    image: config.image.clone(),
                    privileged: self.plan.privileged,
                }),
            )
            .await?
            .into();

        // Stream in the declared inputs, or the whole working tree when the
        // config names none.
        if config.inputs.is_empty() {
            for (name, artifact) in ctx.artifacts.all().await {
                artifact
                    .stream_to(container.as_ref(), &format!("{TASK_DIR}/{name}"))
                    .await?;
            }
        } else {
            for input in &config.inputs {
                let artifact = ctx
                    .artifacts
                    .get(&input.name)
                    .await
                    .ok_or_else(|| Error::UnknownArtifactSource(input.name.clone()))?;
                let dest = input.path.clone().unwrap_or_else(|| input.name.clone());
                artifact
                    .stream_to(container.as_ref(), &format!("{TASK_DIR}/{dest}"))
                    .await?;
            }
        }

        self.delegate
            .start_step(self.origin(OriginSource::Stdout))
            .await;

        let mut env: Vec<(String, String)> = config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        let mut process = container
            .run(ProcessSpec {
                path: config.run.path.clone(),
                args: config.run.args.clone(),
                env,
                dir: Some(TASK_DIR.to_string()),
                privileged: self.plan.privileged,
                stdin: None,
            })
            .await?;

        let result = tokio::select! {
            result = process.wait() => result?,
            _ = abort::aborted(&mut ctx.abort) => {
                container.stop(true).await?;
                container.release();
                return Err(Error::Aborted);
            }
        };

        self.delegate
            .log(self.origin(OriginSource::Stdout), &result.stdout)
            .await;
        self.delegate
            .log(self.origin(OriginSource::Stderr), &result.stderr)
            .await;
        self.delegate
            .finish_step(self.origin(OriginSource::Stdout), result.exit_status)
            .await;

        // Later steps can read the task's working tree under its name.
        ctx.artifacts
            .register(&self.plan.name, Artifact::new(container, TASK_DIR))
            .await;

        Ok(StepOutcome::new(result.exit_status == 0))
    }
}
