//! Resource version history.

use crate::db_err;
use crate::inputs::{self, Candidate, InputCandidates, PassedJobOutputs};
use async_trait::async_trait;
use crucible_core::config::{JobInput, ResourceConfig, Source};
use crucible_core::ids::{BuildId, VersionedResourceId};
use crucible_core::versions::{
    MetadataField, SavedResource, SavedVersionedResource, Version, VersionedResource,
};
use crucible_core::ports::VersionDb;
use crucible_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;

#[derive(Clone)]
pub struct PgVersionDb {
    pool: PgPool,
}

impl PgVersionDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_saved_vr(row: &PgRow) -> SavedVersionedResource {
    SavedVersionedResource {
        id: VersionedResourceId::new(row.get::<i32, _>("id") as i64),
        enabled: row.get("enabled"),
        check_order: row.get("check_order"),
        versioned_resource: VersionedResource {
            resource: row.get("resource_name"),
            resource_type: row.get("type"),
            source: row.get::<Json<Source>, _>("source").0,
            version: row.get::<Json<Version>, _>("version").0,
            metadata: row.get::<Json<Vec<MetadataField>>, _>("metadata").0,
        },
    }
}

pub(crate) async fn ensure_resource(conn: &mut PgConnection, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO resources (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Upserts a versioned resource row keyed by `(resource, version)`.
///
/// A new row is created enabled with the next check order; an existing row
/// keeps its check order and enabled flag, refreshing type/source and, when
/// the caller supplies any, metadata.
pub(crate) async fn upsert_versioned_resource(
    conn: &mut PgConnection,
    vr: &VersionedResource,
) -> Result<SavedVersionedResource> {
    ensure_resource(conn, &vr.resource).await?;

    let row = sqlx::query(
        r#"
        INSERT INTO versioned_resources (resource_name, type, source, version, metadata)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (resource_name, version) DO UPDATE SET
            type = EXCLUDED.type,
            source = EXCLUDED.source,
            metadata = CASE
                WHEN EXCLUDED.metadata <> '[]'::jsonb THEN EXCLUDED.metadata
                ELSE versioned_resources.metadata
            END
        RETURNING id, enabled, check_order, resource_name, type, source, version, metadata
        "#,
    )
    .bind(&vr.resource)
    .bind(&vr.resource_type)
    .bind(Json(&vr.source))
    .bind(Json(&vr.version))
    .bind(Json(&vr.metadata))
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(row_to_saved_vr(&row))
}

#[async_trait]
impl VersionDb for PgVersionDb {
    async fn save_resource_versions(
        &self,
        resource: &ResourceConfig,
        versions: &[Version],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for version in versions {
            upsert_versioned_resource(
                &mut tx,
                &VersionedResource {
                    resource: resource.name.clone(),
                    resource_type: resource.resource_type.clone(),
                    source: resource.source.clone(),
                    version: version.clone(),
                    metadata: vec![],
                },
            )
            .await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_latest_versioned_resource(
        &self,
        resource: &str,
    ) -> Result<SavedVersionedResource> {
        let row = sqlx::query(
            "SELECT id, enabled, check_order, resource_name, type, source, version, metadata \
             FROM versioned_resources WHERE resource_name = $1 \
             ORDER BY check_order DESC LIMIT 1",
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(row_to_saved_vr(&row)),
            None => Err(Error::NoVersions),
        }
    }

    async fn enable_versioned_resource(&self, id: VersionedResourceId) -> Result<()> {
        self.set_enabled(id, true).await
    }

    async fn disable_versioned_resource(&self, id: VersionedResourceId) -> Result<()> {
        self.set_enabled(id, false).await
    }

    async fn version_enabled(&self, resource: &str, version: &Version) -> Result<bool> {
        let row = sqlx::query(
            "SELECT enabled FROM versioned_resources WHERE resource_name = $1 AND version = $2",
        )
        .bind(resource)
        .bind(Json(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("enabled")).unwrap_or(true))
    }

    async fn get_latest_input_versions(
        &self,
        inputs: &[JobInput],
    ) -> Result<Vec<SavedVersionedResource>> {
        let mut candidate_sets = Vec::with_capacity(inputs.len());

        for input in inputs {
            let rows = match &input.version {
                Some(pin) => sqlx::query(
                    "SELECT id, check_order FROM versioned_resources \
                     WHERE resource_name = $1 AND enabled AND version = $2 \
                     ORDER BY check_order DESC",
                )
                .bind(&input.resource)
                .bind(Json(pin))
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
                None => sqlx::query(
                    "SELECT id, check_order FROM versioned_resources \
                     WHERE resource_name = $1 AND enabled \
                     ORDER BY check_order DESC",
                )
                .bind(&input.resource)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
            };

            let candidates = rows
                .iter()
                .map(|r| Candidate {
                    id: VersionedResourceId::new(r.get::<i32, _>("id") as i64),
                    check_order: r.get("check_order"),
                })
                .collect();

            let mut passed = Vec::with_capacity(input.passed.len());
            for job in &input.passed {
                let rows = sqlx::query(
                    "SELECT bo.versioned_resource_id, bo.build_id \
                     FROM build_outputs bo \
                     JOIN builds b ON b.id = bo.build_id \
                     JOIN versioned_resources vr ON vr.id = bo.versioned_resource_id \
                     WHERE b.job_name = $1 AND b.status = 'succeeded' \
                       AND vr.resource_name = $2",
                )
                .bind(job)
                .bind(&input.resource)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

                let mut builds_by_version: HashMap<VersionedResourceId, _> = HashMap::new();
                for row in rows {
                    let vr_id =
                        VersionedResourceId::new(row.get::<i32, _>("versioned_resource_id") as i64);
                    let build_id = BuildId::new(row.get::<i32, _>("build_id") as i64);
                    builds_by_version
                        .entry(vr_id)
                        .or_insert_with(std::collections::BTreeSet::new)
                        .insert(build_id);
                }

                passed.push(PassedJobOutputs {
                    job: job.clone(),
                    builds_by_version,
                });
            }

            candidate_sets.push(InputCandidates {
                name: input.name.clone(),
                candidates,
                passed,
            });
        }

        let chosen = inputs::resolve(&candidate_sets).ok_or(Error::NoVersions)?;

        let mut saved = Vec::with_capacity(chosen.len());
        for id in chosen {
            let row = sqlx::query(
                "SELECT id, enabled, check_order, resource_name, type, source, version, metadata \
                 FROM versioned_resources WHERE id = $1",
            )
            .bind(id.raw() as i32)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            saved.push(row_to_saved_vr(&row));
        }

        Ok(saved)
    }

    async fn get_resource(&self, resource: &str) -> Result<SavedResource> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        ensure_resource(&mut conn, resource).await?;

        let row = sqlx::query("SELECT name, paused, check_error FROM resources WHERE name = $1")
            .bind(resource)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;

        Ok(SavedResource {
            name: row.get("name"),
            paused: row.get("paused"),
            check_error: row.get("check_error"),
        })
    }

    async fn set_resource_paused(&self, resource: &str, paused: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        ensure_resource(&mut conn, resource).await?;
        sqlx::query("UPDATE resources SET paused = $2 WHERE name = $1")
            .bind(resource)
            .bind(paused)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_resource_check_error(&self, resource: &str, error: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        ensure_resource(&mut conn, resource).await?;
        sqlx::query("UPDATE resources SET check_error = $2 WHERE name = $1")
            .bind(resource)
            .bind(error)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

impl PgVersionDb {
    async fn set_enabled(&self, id: VersionedResourceId, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE versioned_resources SET enabled = $2 WHERE id = $1")
            .bind(id.raw() as i32)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(format!(
                "no versioned resource with id {id}"
            )));
        }
        Ok(())
    }
}
