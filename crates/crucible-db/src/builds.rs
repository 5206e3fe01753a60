//! Build lifecycle storage.

use crate::db_err;
use crate::events::{self, PgAbortNotifier, PgBuildEventSource};
use crate::versions::{row_to_saved_vr, upsert_versioned_resource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crucible_core::builds::{Build, BuildStatus};
use crucible_core::config::Source;
use crucible_core::events::{BuildEvent, StatusPayload};
use crucible_core::ids::BuildId;
use crucible_core::ports::{AbortNotifier, BuildDb, BuildEventSource};
use crucible_core::versions::{
    BuildInput, MetadataField, SavedBuildInput, SavedBuildOutput, SavedVersionedResource, Version,
    VersionedResource,
};
use crucible_core::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, QueryBuilder, Row};

const BUILD_COLUMNS: &str =
    "id, name, job_name, pipeline_name, status, engine, engine_metadata, start_time, end_time";

#[derive(Clone)]
pub struct PgBuildDb {
    pool: PgPool,
}

impl PgBuildDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_build(row: &PgRow) -> Result<Build> {
    Ok(Build {
        id: BuildId::new(row.get::<i32, _>("id") as i64),
        name: row.get("name"),
        job_name: row.get("job_name"),
        pipeline_name: row.get("pipeline_name"),
        status: row.get::<String, _>("status").parse()?,
        engine: row.get("engine"),
        engine_metadata: row.get("engine_metadata"),
        start_time: row.get::<Option<DateTime<Utc>>, _>("start_time"),
        end_time: row.get::<Option<DateTime<Utc>>, _>("end_time"),
    })
}

/// Appends `event` with the build's next dense sequence number.
async fn save_event(conn: &mut PgConnection, id: BuildId, event: &BuildEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO build_events (build_id, sequence, payload) \
         SELECT $1, COALESCE(MAX(sequence) + 1, 0), $2 \
         FROM build_events WHERE build_id = $1",
    )
    .bind(id.raw() as i32)
    .bind(Json(event))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn create_build_row(
    conn: &mut PgConnection,
    job: Option<&str>,
) -> Result<Build> {
    let name: String = match job {
        Some(job) => {
            sqlx::query("INSERT INTO jobs (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                .bind(job)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;

            let row = sqlx::query(
                "UPDATE jobs SET build_number = build_number + 1 WHERE name = $1 \
                 RETURNING build_number",
            )
            .bind(job)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;

            row.get::<i32, _>("build_number").to_string()
        }
        None => {
            let row = sqlx::query("SELECT nextval('one_off_name_seq') AS name")
                .fetch_one(&mut *conn)
                .await
                .map_err(db_err)?;
            row.get::<i64, _>("name").to_string()
        }
    };

    let row = sqlx::query(&format!(
        "INSERT INTO builds (name, job_name) VALUES ($1, $2) RETURNING {BUILD_COLUMNS}"
    ))
    .bind(&name)
    .bind(job)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    row_to_build(&row)
}

/// Reads a build's recorded inputs with their first-occurrence flags.
async fn saved_inputs(conn: &mut PgConnection, id: BuildId) -> Result<Vec<SavedBuildInput>> {
    let rows = sqlx::query(
        "SELECT bi.name AS input_name, vr.resource_name, vr.type, vr.source, vr.version, \
                vr.metadata, \
                NOT EXISTS ( \
                    SELECT 1 FROM build_inputs obi \
                    JOIN builds ob ON ob.id = obi.build_id \
                    WHERE obi.versioned_resource_id = bi.versioned_resource_id \
                      AND ob.job_name = b.job_name \
                      AND obi.build_id < bi.build_id \
                ) AS first_occurrence \
         FROM build_inputs bi \
         JOIN versioned_resources vr ON vr.id = bi.versioned_resource_id \
         JOIN builds b ON b.id = bi.build_id \
         WHERE bi.build_id = $1 \
         ORDER BY bi.name",
    )
    .bind(id.raw() as i32)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(rows
        .iter()
        .map(|row| SavedBuildInput {
            name: row.get("input_name"),
            versioned_resource: VersionedResource {
                resource: row.get("resource_name"),
                resource_type: row.get("type"),
                source: row.get::<Json<Source>, _>("source").0,
                version: row.get::<Json<Version>, _>("version").0,
                metadata: row.get::<Json<Vec<MetadataField>>, _>("metadata").0,
            },
            first_occurrence: row.get("first_occurrence"),
        })
        .collect())
}

/// Resolves each `(name, versioned resource)` pair to its row id, or `None`
/// if any version has never been seen.
async fn input_pair_ids(
    conn: &mut PgConnection,
    inputs: &[BuildInput],
) -> Result<Option<Vec<(i32, String)>>> {
    let mut pairs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let row = sqlx::query(
            "SELECT id FROM versioned_resources WHERE resource_name = $1 AND version = $2",
        )
        .bind(&input.versioned_resource.resource)
        .bind(Json(&input.versioned_resource.version))
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => pairs.push((row.get::<i32, _>("id"), input.name.clone())),
            None => return Ok(None),
        }
    }
    Ok(Some(pairs))
}

/// Finds the newest build of `job` whose inputs include every given pair.
/// `exact` additionally requires the build to have no other inputs and to
/// still be pending.
async fn find_build_for_pairs(
    conn: &mut PgConnection,
    job: &str,
    pairs: &[(i32, String)],
    exact: bool,
) -> Result<Option<Build>> {
    let mut query: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
        "SELECT {BUILD_COLUMNS} FROM builds b WHERE b.job_name = "
    ));
    query.push_bind(job);

    for (vr_id, name) in pairs {
        query.push(
            " AND EXISTS (SELECT 1 FROM build_inputs bi WHERE bi.build_id = b.id \
             AND bi.versioned_resource_id = ",
        );
        query.push_bind(*vr_id);
        query.push(" AND bi.name = ");
        query.push_bind(name.as_str());
        query.push(")");
    }

    if exact {
        query.push(" AND b.status = 'pending'");
        query.push(" AND (SELECT COUNT(*) FROM build_inputs WHERE build_id = b.id) = ");
        query.push_bind(pairs.len() as i64);
    }

    query.push(" ORDER BY b.id DESC LIMIT 1");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

    row.map(|row| row_to_build(&row)).transpose()
}

#[async_trait]
impl BuildDb for PgBuildDb {
    async fn create_job_build(&self, job: &str) -> Result<Build> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let build = create_build_row(&mut tx, Some(job)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(build)
    }

    async fn create_job_build_with_inputs(
        &self,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Build> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialise concurrent schedulers creating builds for the same job
        // so the input-set uniqueness check cannot race.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('build-inputs: ' || $1))")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut pairs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let saved = upsert_versioned_resource(&mut tx, &input.versioned_resource).await?;
            pairs.push((saved.id.raw() as i32, input.name.clone()));
        }

        if let Some(existing) = find_build_for_pairs(&mut tx, job, &pairs, true).await? {
            tx.commit().await.map_err(db_err)?;
            return Ok(existing);
        }

        let build = create_build_row(&mut tx, Some(job)).await?;
        for (vr_id, name) in &pairs {
            sqlx::query(
                "INSERT INTO build_inputs (build_id, versioned_resource_id, name) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(build.id.raw() as i32)
            .bind(*vr_id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(build)
    }

    async fn create_one_off_build(&self) -> Result<Build> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let build = create_build_row(&mut tx, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(build)
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"
        ))
        .bind(id.raw() as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_build(&row),
            None => Err(Error::NoBuild),
        }
    }

    async fn get_job_build(&self, job: &str, name: &str) -> Result<Build> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE job_name = $1 AND name = $2"
        ))
        .bind(job)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_build(&row),
            None => Err(Error::NoBuild),
        }
    }

    async fn get_all_builds(&self) -> Result<Vec<Build>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_build).collect()
    }

    async fn get_all_job_builds(&self, job: &str) -> Result<Vec<Build>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE job_name = $1 ORDER BY id DESC"
        ))
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_build).collect()
    }

    async fn get_all_started_builds(&self) -> Result<Vec<Build>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE status = 'started' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_build).collect()
    }

    async fn get_current_build(&self, job: &str) -> Result<Build> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE job_name = $1 AND status != 'pending' ORDER BY id DESC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            return row_to_build(&row);
        }

        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE job_name = $1 AND status = 'pending' ORDER BY id ASC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_build(&row),
            None => Err(Error::NoBuild),
        }
    }

    async fn get_job_finished_and_next_build(
        &self,
        job: &str,
    ) -> Result<(Option<Build>, Option<Build>)> {
        let finished = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE job_name = $1 AND status IN ('aborted', 'errored', 'failed', 'succeeded') \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| row_to_build(&row))
        .transpose()?;

        let next = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE job_name = $1 AND status IN ('pending', 'started') \
             ORDER BY id ASC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| row_to_build(&row))
        .transpose()?;

        Ok((finished, next))
    }

    async fn get_next_pending_build(
        &self,
        job: &str,
    ) -> Result<(Build, Vec<SavedBuildInput>)> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE job_name = $1 AND status = 'pending' ORDER BY id ASC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let build = match row {
            Some(row) => row_to_build(&row)?,
            None => return Err(Error::NoBuild),
        };

        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let inputs = saved_inputs(&mut conn, build.id).await?;
        Ok((build, inputs))
    }

    async fn get_job_build_for_inputs(&self, job: &str, inputs: &[BuildInput]) -> Result<Build> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let pairs = match input_pair_ids(&mut conn, inputs).await? {
            Some(pairs) => pairs,
            None => return Err(Error::NoBuild),
        };

        match find_build_for_pairs(&mut conn, job, &pairs, false).await? {
            Some(build) => Ok(build),
            None => Err(Error::NoBuild),
        }
    }

    async fn schedule_build(&self, id: BuildId, serial: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds AS b SET scheduled = true \
             WHERE b.id = $1 \
               AND b.status = 'pending' \
               AND ($2 = false OR ( \
                   NOT EXISTS ( \
                       SELECT 1 FROM builds o \
                       WHERE o.job_name = b.job_name \
                         AND o.id < b.id \
                         AND o.status = 'pending' \
                   ) \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM builds o \
                       WHERE o.job_name = b.job_name \
                         AND o.id != b.id \
                         AND (o.status = 'started' \
                              OR (o.status = 'pending' AND o.scheduled)) \
                   ) \
               ))",
        )
        .bind(id.raw() as i32)
        .bind(serial)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn start_build(&self, id: BuildId, engine: &str, metadata: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE builds SET status = 'started', engine = $2, engine_metadata = $3, \
             start_time = now() WHERE id = $1 AND status = 'pending' \
             RETURNING start_time",
        )
        .bind(id.raw() as i32)
        .bind(engine)
        .bind(metadata)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let start_time: DateTime<Utc> = match row {
            Some(row) => row.get("start_time"),
            None => return Ok(false),
        };

        save_event(
            &mut tx,
            id,
            &BuildEvent::Status(StatusPayload {
                status: BuildStatus::Started,
                time: start_time.timestamp(),
            }),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        events::notify(&self.pool, &events::events_channel(id)).await?;
        Ok(true)
    }

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE builds SET status = $2, end_time = now() WHERE id = $1 \
             RETURNING end_time",
        )
        .bind(id.raw() as i32)
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let end_time: DateTime<Utc> = match row {
            Some(row) => row.get("end_time"),
            None => return Err(Error::NoBuild),
        };

        save_event(
            &mut tx,
            id,
            &BuildEvent::Status(StatusPayload {
                status,
                time: end_time.timestamp(),
            }),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        events::notify(&self.pool, &events::events_channel(id)).await?;
        Ok(())
    }

    async fn abort_build(&self, id: BuildId) -> Result<()> {
        sqlx::query(
            "UPDATE builds SET status = 'aborted', end_time = COALESCE(end_time, now()) \
             WHERE id = $1 \
               AND status NOT IN ('aborted', 'errored', 'failed', 'succeeded')",
        )
        .bind(id.raw() as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Abort is sticky; notify unconditionally so racing subscribers
        // re-read the status.
        events::notify(&self.pool, &events::abort_channel(id)).await?;
        events::notify(&self.pool, &events::events_channel(id)).await?;
        Ok(())
    }

    async fn abort_notifier(&self, id: BuildId) -> Result<Box<dyn AbortNotifier>> {
        Ok(Box::new(
            PgAbortNotifier::subscribe(self.pool.clone(), id).await?,
        ))
    }

    async fn save_build_event(&self, id: BuildId, event: &BuildEvent) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        save_event(&mut conn, id, event).await?;
        events::notify(&self.pool, &events::events_channel(id)).await?;
        Ok(())
    }

    async fn get_build_events(
        &self,
        id: BuildId,
        from: u32,
    ) -> Result<Box<dyn BuildEventSource>> {
        Ok(Box::new(
            PgBuildEventSource::subscribe(self.pool.clone(), id, from).await?,
        ))
    }

    async fn save_build_engine_metadata(&self, id: BuildId, metadata: &str) -> Result<()> {
        sqlx::query("UPDATE builds SET engine_metadata = $2 WHERE id = $1")
            .bind(id.raw() as i32)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn save_build_input(
        &self,
        id: BuildId,
        input: &BuildInput,
    ) -> Result<SavedVersionedResource> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let saved = upsert_versioned_resource(&mut tx, &input.versioned_resource).await?;

        sqlx::query(
            "INSERT INTO build_inputs (build_id, versioned_resource_id, name) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(id.raw() as i32)
        .bind(saved.id.raw() as i32)
        .bind(&input.name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(saved)
    }

    async fn save_build_output(
        &self,
        id: BuildId,
        vr: &VersionedResource,
    ) -> Result<SavedVersionedResource> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let saved = upsert_versioned_resource(&mut tx, vr).await?;

        sqlx::query(
            "INSERT INTO build_outputs (build_id, versioned_resource_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id.raw() as i32)
        .bind(saved.id.raw() as i32)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(saved)
    }

    async fn get_build_resources(
        &self,
        id: BuildId,
    ) -> Result<(Vec<SavedBuildInput>, Vec<SavedBuildOutput>)> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let inputs = saved_inputs(&mut conn, id).await?;

        // Outputs are versions the build produced, not ones it merely
        // passed through from its inputs.
        let rows = sqlx::query(
            "SELECT vr.id, vr.enabled, vr.check_order, vr.resource_name, vr.type, vr.source, \
                    vr.version, vr.metadata \
             FROM build_outputs bo \
             JOIN versioned_resources vr ON vr.id = bo.versioned_resource_id \
             WHERE bo.build_id = $1 \
               AND bo.versioned_resource_id NOT IN ( \
                   SELECT versioned_resource_id FROM build_inputs WHERE build_id = $1 \
               ) \
             ORDER BY vr.check_order",
        )
        .bind(id.raw() as i32)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let outputs = rows
            .iter()
            .map(|row| SavedBuildOutput {
                versioned_resource: row_to_saved_vr(row).versioned_resource,
            })
            .collect();

        Ok((inputs, outputs))
    }
}
