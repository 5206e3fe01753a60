//! Named advisory locks.
//!
//! Lock names map to bigint keys through a registry table; the keys are
//! taken as Postgres session advisory locks on a dedicated pooled
//! connection held inside the guard. A holder that dies loses its session
//! and the database releases its locks, which is the whole point of doing
//! this in the store instead of in process memory.

use crate::db_err;
use async_trait::async_trait;
use crucible_core::ports::{Lock, Locker, NamedLock};
use crucible_core::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};

#[derive(Clone)]
pub struct PgLocker {
    pool: PgPool,
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Shared,
    Exclusive,
}

impl PgLocker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn acquire(
        &self,
        locks: Vec<NamedLock>,
        mode: Mode,
        block: bool,
    ) -> Result<Box<dyn Lock>> {
        let mut names: Vec<String> = locks.into_iter().map(|l| l.name().to_string()).collect();
        // Sorted acquisition order keeps multi-name holders from
        // deadlocking each other.
        names.sort();
        names.dedup();

        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let mut keys = Vec::with_capacity(names.len());

        for name in &names {
            let key = register_name(&mut conn, name).await?;

            let acquired = if block {
                let statement = match mode {
                    Mode::Exclusive => "SELECT pg_advisory_lock($1)",
                    Mode::Shared => "SELECT pg_advisory_lock_shared($1)",
                };
                sqlx::query(statement)
                    .bind(key)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
                true
            } else {
                let statement = match mode {
                    Mode::Exclusive => "SELECT pg_try_advisory_lock($1) AS ok",
                    Mode::Shared => "SELECT pg_try_advisory_lock_shared($1) AS ok",
                };
                sqlx::query(statement)
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(db_err)?
                    .get::<bool, _>("ok")
            };

            if !acquired {
                unlock_all(&mut conn, &keys, mode).await?;
                return Err(Error::LockConflict);
            }

            keys.push(key);
        }

        Ok(Box::new(PgLock { conn, keys, mode }))
    }
}

async fn register_name(conn: &mut PoolConnection<Postgres>, name: &str) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO lock_names (name) VALUES ($1) \
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
         RETURNING id",
    )
    .bind(name)
    .fetch_one(&mut **conn)
    .await
    .map_err(db_err)?;
    Ok(row.get("id"))
}

async fn unlock_all(
    conn: &mut PoolConnection<Postgres>,
    keys: &[i64],
    mode: Mode,
) -> Result<()> {
    let statement = match mode {
        Mode::Exclusive => "SELECT pg_advisory_unlock($1)",
        Mode::Shared => "SELECT pg_advisory_unlock_shared($1)",
    };
    for key in keys {
        sqlx::query(statement)
            .bind(key)
            .execute(&mut **conn)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

#[async_trait]
impl Locker for PgLocker {
    async fn acquire_write_lock(&self, locks: Vec<NamedLock>) -> Result<Box<dyn Lock>> {
        self.acquire(locks, Mode::Exclusive, true).await
    }

    async fn acquire_write_lock_immediately(
        &self,
        locks: Vec<NamedLock>,
    ) -> Result<Box<dyn Lock>> {
        self.acquire(locks, Mode::Exclusive, false).await
    }

    async fn acquire_read_lock(&self, locks: Vec<NamedLock>) -> Result<Box<dyn Lock>> {
        self.acquire(locks, Mode::Shared, true).await
    }

    async fn list_locks(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM lock_names ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }
}

struct PgLock {
    conn: PoolConnection<Postgres>,
    keys: Vec<i64>,
    mode: Mode,
}

#[async_trait]
impl Lock for PgLock {
    async fn release(mut self: Box<Self>) -> Result<()> {
        unlock_all(&mut self.conn, &self.keys, self.mode).await?;

        // The last holder system-wide cleans the name out of the registry.
        // An exclusive probe only succeeds when nobody holds the key.
        for key in &self.keys {
            let free = sqlx::query("SELECT pg_try_advisory_lock($1) AS ok")
                .bind(key)
                .fetch_one(&mut *self.conn)
                .await
                .map_err(db_err)?
                .get::<bool, _>("ok");

            if free {
                sqlx::query("DELETE FROM lock_names WHERE id = $1")
                    .bind(key)
                    .execute(&mut *self.conn)
                    .await
                    .map_err(db_err)?;
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&mut *self.conn)
                    .await
                    .map_err(db_err)?;
            }
        }

        Ok(())
    }
}
