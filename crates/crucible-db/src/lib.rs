//! PostgreSQL store for the Crucible control plane.
//!
//! Everything durable lives here: pipeline configs, resource version
//! histories, builds with their inputs/outputs and event streams, worker
//! registrations, and the advisory named locks. Notifications ride on
//! LISTEN/NOTIFY channels so subscribers never poll blind.

mod builds;
mod configs;
mod events;
mod inputs;
mod locks;
mod migrations;
mod versions;
mod workers;

pub use builds::PgBuildDb;
pub use configs::PgConfigDb;
pub use events::{EventStreamCloser, PgAbortNotifier, PgBuildEventSource};
pub use inputs::{Candidate, InputCandidates, PassedJobOutputs};
pub use locks::PgLocker;
pub use versions::PgVersionDb;
pub use workers::PgWorkerDb;

use crucible_core::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub(crate) fn db_err(err: sqlx::Error) -> Error {
    Error::Database(err.to_string())
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(db_err)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }

    pub fn build_db(&self) -> PgBuildDb {
        PgBuildDb::new(self.pool.clone())
    }

    pub fn version_db(&self) -> PgVersionDb {
        PgVersionDb::new(self.pool.clone())
    }

    pub fn config_db(&self) -> PgConfigDb {
        PgConfigDb::new(self.pool.clone())
    }

    pub fn worker_db(&self) -> PgWorkerDb {
        PgWorkerDb::new(self.pool.clone())
    }

    pub fn locker(&self) -> PgLocker {
        PgLocker::new(self.pool.clone())
    }
}
