//! The periodic scheduling loop.

use crate::scheduler::Scheduler;
use crucible_core::ports::{ConfigDb, Locker, NamedLock};
use crucible_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Walks every configured pipeline's jobs each tick, taking the per-job
/// scheduling lock so only one control plane schedules a job at a time.
/// Config is re-read every cycle, so changes propagate without a restart.
pub struct Runner {
    locker: Arc<dyn Locker>,
    configs: Arc<dyn ConfigDb>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl Runner {
    pub fn new(
        locker: Arc<dyn Locker>,
        configs: Arc<dyn ConfigDb>,
        scheduler: Arc<Scheduler>,
        interval: Duration,
    ) -> Self {
        Self {
            locker,
            configs,
            scheduler,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "scheduler starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "scheduling tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        for pipeline in self.configs.get_pipelines().await? {
            if pipeline.paused {
                continue;
            }

            let (config, _) = self.configs.get_config(&pipeline.name).await?;
            for job in &config.jobs {
                let lock_name =
                    NamedLock::job_scheduling(&format!("{}:{}", pipeline.name, job.name));

                let lock = match self
                    .locker
                    .acquire_write_lock_immediately(vec![lock_name])
                    .await
                {
                    Ok(lock) => lock,
                    Err(Error::LockConflict) => {
                        debug!(job = job.name, "scheduling lock held elsewhere");
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                if let Err(err) = self.scheduler.build_latest_inputs(job).await {
                    warn!(job = job.name, error = %err, "input scheduling failed");
                }
                if let Err(err) = self
                    .scheduler
                    .try_next_pending_build(job, &config.resources)
                    .await
                {
                    warn!(job = job.name, error = %err, "pending build scheduling failed");
                }

                lock.release().await?;
            }
        }

        Ok(())
    }
}
