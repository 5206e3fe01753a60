//! Pipeline configuration storage.

use crate::db_err;
use async_trait::async_trait;
use crucible_core::config::PipelineConfig;
use crucible_core::ids::ConfigVersion;
use crucible_core::ports::{ConfigDb, SavedPipeline};
use crucible_core::{Error, Result};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgConfigDb {
    pool: PgPool,
}

impl PgConfigDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigDb for PgConfigDb {
    async fn save_config(
        &self,
        pipeline: &str,
        config: &PipelineConfig,
        expected_version: ConfigVersion,
        paused: Option<bool>,
    ) -> Result<ConfigVersion> {
        if expected_version == 0 {
            let row = sqlx::query(
                "INSERT INTO pipelines (name, config, paused) VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO NOTHING \
                 RETURNING version",
            )
            .bind(pipeline)
            .bind(Json(config))
            .bind(paused.unwrap_or(false))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            return match row {
                Some(row) => Ok(row.get("version")),
                // Somebody created it since the caller last looked.
                None => Err(Error::ConfigComparisonFailed),
            };
        }

        let row = sqlx::query(
            "UPDATE pipelines SET config = $2, version = version + 1, \
             paused = COALESCE($4, paused) \
             WHERE name = $1 AND version = $3 \
             RETURNING version",
        )
        .bind(pipeline)
        .bind(Json(config))
        .bind(expected_version)
        .bind(paused)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(row.get("version")),
            None => Err(Error::ConfigComparisonFailed),
        }
    }

    async fn get_config(&self, pipeline: &str) -> Result<(PipelineConfig, ConfigVersion)> {
        let row = sqlx::query("SELECT config, version FROM pipelines WHERE name = $1")
            .bind(pipeline)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok((
                row.get::<Json<PipelineConfig>, _>("config").0,
                row.get("version"),
            )),
            None => Err(Error::PipelineNotFound(pipeline.to_string())),
        }
    }

    async fn get_pipelines(&self) -> Result<Vec<SavedPipeline>> {
        let rows = sqlx::query("SELECT name, version, paused FROM pipelines ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| SavedPipeline {
                name: row.get("name"),
                version: row.get("version"),
                paused: row.get("paused"),
            })
            .collect())
    }

    async fn set_pipeline_paused(&self, pipeline: &str, paused: bool) -> Result<()> {
        let result = sqlx::query("UPDATE pipelines SET paused = $2 WHERE name = $1")
            .bind(pipeline)
            .bind(paused)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(pipeline.to_string()));
        }
        Ok(())
    }
}
