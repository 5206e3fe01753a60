//! Application state shared across handlers.

use crate::auth::BasicAuth;
use crate::pipes::Pipes;
use crucible_core::ports::{BuildDb, ConfigDb, VersionDb, WorkerDb};
use crucible_engine::Engine;
use std::sync::Arc;

pub struct AppState {
    pub builds: Arc<dyn BuildDb>,
    pub versions: Arc<dyn VersionDb>,
    pub configs: Arc<dyn ConfigDb>,
    pub workers: Arc<dyn WorkerDb>,
    pub engine: Arc<dyn Engine>,
    pub pipes: Pipes,
    pub auth: Option<BasicAuth>,
}

impl AppState {
    pub fn new(
        builds: Arc<dyn BuildDb>,
        versions: Arc<dyn VersionDb>,
        configs: Arc<dyn ConfigDb>,
        workers: Arc<dyn WorkerDb>,
        engine: Arc<dyn Engine>,
        auth: Option<BasicAuth>,
    ) -> Self {
        Self {
            builds,
            versions,
            configs,
            workers,
            engine,
            pipes: Pipes::default(),
            auth,
        }
    }
}
