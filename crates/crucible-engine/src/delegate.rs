//! Build delegate: everything a step reports goes through here.

use async_trait::async_trait;
use chrono::Utc;
use crucible_core::builds::BuildStatus;
use crucible_core::events::{
    BuildEvent, ErrorPayload, FinishPayload, InputPayload, LogPayload, Origin, OutputPayload,
    StartPayload,
};
use crucible_core::ids::BuildId;
use crucible_core::plan::{GetPlan, PutPlan};
use crucible_core::ports::BuildDb;
use crucible_core::versions::{BuildInput, MetadataField, Version, VersionedResource};
use crucible_core::Result;
use std::sync::Arc;
use tracing::warn;

/// Records step events against the build and persists its inputs/outputs.
///
/// Event recording is best-effort: a failed append is logged, not fatal to
/// the build.
#[async_trait]
pub trait BuildDelegate: Send + Sync {
    async fn log(&self, origin: Origin, message: &str);
    async fn error(&self, origin: Option<Origin>, message: &str);
    async fn start_step(&self, origin: Origin);
    async fn finish_step(&self, origin: Origin, exit_status: i32);
    async fn input_received(
        &self,
        origin: Origin,
        plan: &GetPlan,
        version: &Version,
        metadata: &[MetadataField],
    );
    async fn output_produced(
        &self,
        origin: Origin,
        plan: &PutPlan,
        version: &Version,
        metadata: &[MetadataField],
    );

    /// Marks the build terminal according to how execution ended.
    async fn finish(&self, result: Result<bool>, aborted: bool);
}

pub struct DbBuildDelegate {
    db: Arc<dyn BuildDb>,
    build_id: BuildId,
}

impl DbBuildDelegate {
    pub fn new(db: Arc<dyn BuildDb>, build_id: BuildId) -> Self {
        Self { db, build_id }
    }

    async fn emit(&self, event: BuildEvent) {
        if let Err(err) = self.db.save_build_event(self.build_id, &event).await {
            warn!(build = %self.build_id, error = %err, "failed to save build event");
        }
    }
}

#[async_trait]
impl BuildDelegate for DbBuildDelegate {
    async fn log(&self, origin: Origin, message: &str) {
        if message.is_empty() {
            return;
        }
        self.emit(BuildEvent::Log(LogPayload {
            origin,
            payload: message.to_string(),
        }))
        .await;
    }

    async fn error(&self, origin: Option<Origin>, message: &str) {
        self.emit(BuildEvent::Error(ErrorPayload {
            origin,
            message: message.to_string(),
        }))
        .await;
    }

    async fn start_step(&self, origin: Origin) {
        self.emit(BuildEvent::Start(StartPayload {
            origin,
            time: Utc::now().timestamp(),
        }))
        .await;
    }

    async fn finish_step(&self, origin: Origin, exit_status: i32) {
        self.emit(BuildEvent::Finish(FinishPayload {
            origin,
            time: Utc::now().timestamp(),
            exit_status,
        }))
        .await;
    }

    async fn input_received(
        &self,
        origin: Origin,
        plan: &GetPlan,
        version: &Version,
        metadata: &[MetadataField],
    ) {
        let input = BuildInput {
            name: plan.name.clone(),
            versioned_resource: VersionedResource {
                resource: plan.resource.clone(),
                resource_type: plan.resource_type.clone(),
                source: plan.source.clone(),
                version: version.clone(),
                metadata: metadata.to_vec(),
            },
        };

        if let Err(err) = self.db.save_build_input(self.build_id, &input).await {
            warn!(build = %self.build_id, error = %err, "failed to save build input");
        }

        self.emit(BuildEvent::Input(InputPayload {
            origin,
            input: plan.name.clone(),
            resource: plan.resource.clone(),
            version: version.clone(),
            metadata: metadata.to_vec(),
        }))
        .await;
    }

    async fn output_produced(
        &self,
        origin: Origin,
        plan: &PutPlan,
        version: &Version,
        metadata: &[MetadataField],
    ) {
        let vr = VersionedResource {
            resource: plan.resource.clone(),
            resource_type: plan.resource_type.clone(),
            source: plan.source.clone(),
            version: version.clone(),
            metadata: metadata.to_vec(),
        };

        if let Err(err) = self.db.save_build_output(self.build_id, &vr).await {
            warn!(build = %self.build_id, error = %err, "failed to save build output");
        }

        self.emit(BuildEvent::Output(OutputPayload {
            origin,
            resource: plan.resource.clone(),
            version: version.clone(),
            metadata: metadata.to_vec(),
        }))
        .await;
    }

    async fn finish(&self, result: Result<bool>, aborted: bool) {
        let status = if aborted {
            BuildStatus::Aborted
        } else {
            match &result {
                Ok(true) => BuildStatus::Succeeded,
                Ok(false) => BuildStatus::Failed,
                Err(err) => {
                    self.error(None, &err.to_string()).await;
                    BuildStatus::Errored
                }
            }
        };

        if let Err(err) = self.db.finish_build(self.build_id, status).await {
            warn!(build = %self.build_id, error = %err, "failed to finish build");
        }
    }
}
