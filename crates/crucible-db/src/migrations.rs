//! Schema setup.
//!
//! The statements are idempotent so every process can run them at startup;
//! the first one through does the work.

use crate::db_err;
use crucible_core::Result;
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        config JSONB NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        paused BOOLEAN NOT NULL DEFAULT false
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        paused BOOLEAN NOT NULL DEFAULT false,
        check_error TEXT
    )
    "#,
    "CREATE SEQUENCE IF NOT EXISTS check_order_seq",
    r#"
    CREATE TABLE IF NOT EXISTS versioned_resources (
        id SERIAL PRIMARY KEY,
        resource_name TEXT NOT NULL,
        type TEXT NOT NULL,
        source JSONB NOT NULL DEFAULT '{}'::jsonb,
        version JSONB NOT NULL,
        metadata JSONB NOT NULL DEFAULT '[]'::jsonb,
        enabled BOOLEAN NOT NULL DEFAULT true,
        check_order BIGINT NOT NULL DEFAULT nextval('check_order_seq'),
        UNIQUE (resource_name, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        name TEXT PRIMARY KEY,
        build_number INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE SEQUENCE IF NOT EXISTS one_off_name_seq",
    r#"
    CREATE TABLE IF NOT EXISTS builds (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        job_name TEXT,
        pipeline_name TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        scheduled BOOLEAN NOT NULL DEFAULT false,
        engine TEXT,
        engine_metadata TEXT,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_builds_job_name ON builds (job_name)",
    "CREATE INDEX IF NOT EXISTS idx_builds_status ON builds (status)",
    r#"
    CREATE TABLE IF NOT EXISTS build_events (
        build_id INTEGER NOT NULL REFERENCES builds (id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL,
        payload JSONB NOT NULL,
        PRIMARY KEY (build_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS build_inputs (
        build_id INTEGER NOT NULL REFERENCES builds (id) ON DELETE CASCADE,
        versioned_resource_id INTEGER NOT NULL REFERENCES versioned_resources (id),
        name TEXT NOT NULL,
        UNIQUE (build_id, versioned_resource_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS build_outputs (
        build_id INTEGER NOT NULL REFERENCES builds (id) ON DELETE CASCADE,
        versioned_resource_id INTEGER NOT NULL REFERENCES versioned_resources (id),
        UNIQUE (build_id, versioned_resource_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        addr TEXT PRIMARY KEY,
        expires TIMESTAMPTZ,
        active_containers INTEGER NOT NULL DEFAULT 0,
        resource_types JSONB NOT NULL DEFAULT '[]'::jsonb,
        platform TEXT NOT NULL DEFAULT '',
        tags JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lock_names (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
];

pub async fn run(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await.map_err(db_err)?;
    }
    Ok(())
}
