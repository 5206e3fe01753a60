//! Worker registration storage.

use crate::db_err;
use async_trait::async_trait;
use crucible_core::ports::WorkerDb;
use crucible_core::workers::{WorkerInfo, WorkerResourceType};
use crucible_core::Result;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Clone)]
pub struct PgWorkerDb {
    pool: PgPool,
}

impl PgWorkerDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerDb for PgWorkerDb {
    async fn save_worker(&self, info: &WorkerInfo, ttl: Duration) -> Result<()> {
        // Re-registration overwrites the row including its deadline; a zero
        // TTL pins the worker indefinitely.
        sqlx::query(
            "INSERT INTO workers (addr, expires, active_containers, resource_types, platform, tags) \
             VALUES ($1, CASE WHEN $2 = 0 THEN NULL ELSE now() + $2 * interval '1 second' END, \
                     $3, $4, $5, $6) \
             ON CONFLICT (addr) DO UPDATE SET \
                 expires = EXCLUDED.expires, \
                 active_containers = EXCLUDED.active_containers, \
                 resource_types = EXCLUDED.resource_types, \
                 platform = EXCLUDED.platform, \
                 tags = EXCLUDED.tags",
        )
        .bind(&info.addr)
        .bind(ttl.as_secs_f64())
        .bind(info.active_containers as i32)
        .bind(Json(&info.resource_types))
        .bind(&info.platform)
        .bind(Json(&info.tags))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        let rows = sqlx::query(
            "SELECT addr, active_containers, resource_types, platform, tags \
             FROM workers WHERE expires IS NULL OR expires > now() \
             ORDER BY addr",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| WorkerInfo {
                addr: row.get("addr"),
                active_containers: row.get::<i32, _>("active_containers") as u32,
                resource_types: row
                    .get::<Json<Vec<WorkerResourceType>>, _>("resource_types")
                    .0,
                platform: row.get("platform"),
                tags: row.get::<Json<Vec<String>>, _>("tags").0,
            })
            .collect())
    }
}
