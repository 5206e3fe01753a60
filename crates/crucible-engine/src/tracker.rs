//! Resuming in-flight builds after a restart.

use crate::engine::Engines;
use crucible_core::builds::BuildStatus;
use crucible_core::ports::BuildDb;
use crucible_core::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BuildTracker {
    db: Arc<dyn BuildDb>,
    engines: Arc<Engines>,
}

impl BuildTracker {
    pub fn new(db: Arc<dyn BuildDb>, engines: Arc<Engines>) -> Self {
        Self { db, engines }
    }

    /// Looks up every started build and resumes it on its engine. Builds
    /// whose engine is unknown or whose metadata cannot be reconstructed
    /// are marked errored.
    pub async fn track(&self) -> Result<()> {
        for build in self.db.get_all_started_builds().await? {
            let engine_name = match &build.engine {
                Some(engine) => engine.clone(),
                None => {
                    warn!(build = %build.id, "started build has no engine");
                    self.db.finish_build(build.id, BuildStatus::Errored).await?;
                    continue;
                }
            };

            let running = match self.engines.lookup(&engine_name) {
                Ok(engine) => engine.lookup_build(&build).await,
                Err(err) => Err(err),
            };

            match running {
                Ok(running) => {
                    info!(build = %build.id, engine = engine_name, "resuming build");
                    tokio::spawn(async move { running.resume().await });
                }
                Err(err) => {
                    warn!(build = %build.id, error = %err, "cannot resume build");
                    self.db.finish_build(build.id, BuildStatus::Errored).await?;
                }
            }
        }

        Ok(())
    }
}
