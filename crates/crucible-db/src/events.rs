//! Build event streams and the abort notifier.
//!
//! Both ride on LISTEN/NOTIFY: a channel per build for events, another for
//! aborts. Payloads carry nothing; a notification only means "re-read the
//! store", so duplicate or coalesced ticks are harmless.

use crate::db_err;
use async_trait::async_trait;
use crucible_core::builds::BuildStatus;
use crucible_core::events::BuildEvent;
use crucible_core::ids::BuildId;
use crucible_core::ports::{AbortNotifier, BuildEventSource};
use crucible_core::{Error, Result};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub(crate) fn events_channel(id: BuildId) -> String {
    format!("build_events_{id}")
}

pub(crate) fn abort_channel(id: BuildId) -> String {
    format!("build_abort_{id}")
}

pub(crate) async fn notify(pool: &PgPool, channel: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Replays persisted events in sequence order, then tails the build's
/// notification channel until the build is terminal.
pub struct PgBuildEventSource {
    pool: PgPool,
    build_id: BuildId,
    next_seq: i32,
    listener: PgListener,
    closed: Arc<AtomicBool>,
    close_wakeup: Arc<Notify>,
}

/// Wakes a blocked `next` from another task and marks the stream closed.
#[derive(Clone)]
pub struct EventStreamCloser {
    closed: Arc<AtomicBool>,
    close_wakeup: Arc<Notify>,
}

impl EventStreamCloser {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_wakeup.notify_waiters();
    }
}

impl PgBuildEventSource {
    pub(crate) async fn subscribe(pool: PgPool, build_id: BuildId, from: u32) -> Result<Self> {
        // Listen before the first read so no notification is lost between
        // draining the backlog and tailing.
        let mut listener = PgListener::connect_with(&pool).await.map_err(db_err)?;
        listener
            .listen(&events_channel(build_id))
            .await
            .map_err(db_err)?;

        Ok(Self {
            pool,
            build_id,
            next_seq: from as i32,
            listener,
            closed: Arc::new(AtomicBool::new(false)),
            close_wakeup: Arc::new(Notify::new()),
        })
    }

    pub fn closer(&self) -> EventStreamCloser {
        EventStreamCloser {
            closed: self.closed.clone(),
            close_wakeup: self.close_wakeup.clone(),
        }
    }

    async fn build_status(&self) -> Result<BuildStatus> {
        let row = sqlx::query("SELECT status FROM builds WHERE id = $1")
            .bind(self.build_id.raw() as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => row.get::<String, _>("status").parse(),
            None => Err(Error::NoBuild),
        }
    }
}

#[async_trait]
impl BuildEventSource for PgBuildEventSource {
    async fn next(&mut self) -> Result<BuildEvent> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::StreamClosed);
            }

            let row = sqlx::query(
                "SELECT payload FROM build_events WHERE build_id = $1 AND sequence = $2",
            )
            .bind(self.build_id.raw() as i32)
            .bind(self.next_seq)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                self.next_seq += 1;
                let payload: serde_json::Value = row.get("payload");
                return Ok(serde_json::from_value(payload)?);
            }

            if self.build_status().await?.is_terminal() {
                return Err(Error::EndOfStream);
            }

            tokio::select! {
                received = self.listener.recv() => {
                    received.map_err(|e| Error::Bus(e.to_string()))?;
                }
                _ = self.close_wakeup.notified() => {}
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_wakeup.notify_waiters();
    }
}

/// Resolves once the build is aborted. Sticky: subscribing after the abort
/// resolves immediately.
pub struct PgAbortNotifier {
    pool: PgPool,
    build_id: BuildId,
    listener: PgListener,
}

impl PgAbortNotifier {
    pub(crate) async fn subscribe(pool: PgPool, build_id: BuildId) -> Result<Self> {
        let mut listener = PgListener::connect_with(&pool).await.map_err(db_err)?;
        listener
            .listen(&abort_channel(build_id))
            .await
            .map_err(db_err)?;

        Ok(Self {
            pool,
            build_id,
            listener,
        })
    }
}

#[async_trait]
impl AbortNotifier for PgAbortNotifier {
    async fn notified(&mut self) -> Result<()> {
        loop {
            let row = sqlx::query("SELECT status FROM builds WHERE id = $1")
                .bind(self.build_id.raw() as i32)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

            let status: BuildStatus = match row {
                Some(row) => row.get::<String, _>("status").parse()?,
                None => return Err(Error::NoBuild),
            };

            if status == BuildStatus::Aborted {
                return Ok(());
            }

            self.listener
                .recv()
                .await
                .map_err(|e| Error::Bus(e.to_string()))?;
        }
    }
}
