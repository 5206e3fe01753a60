//! Container keepalive heartbeat.

use async_trait::async_trait;
use crucible_core::ports::{Container, Process, ProcessSpec};
use crucible_core::workers::PROPERTY_KEEPALIVE;
use crucible_core::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// Wraps a container with a background task that periodically stamps the
/// keepalive property with the current wall-clock second. Releasing (or
/// destroying) the container stops the heartbeat.
pub struct HeartbeatedContainer {
    inner: Arc<dyn Container>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatedContainer {
    pub fn start(inner: Arc<dyn Container>, every: Duration) -> Self {
        let container = inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            // The first tick fires immediately; the container was just
            // created or looked up, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp().to_string();
                if let Err(err) = container.set_property(PROPERTY_KEEPALIVE, &now).await {
                    debug!(handle = container.handle(), error = %err, "keepalive failed");
                }
            }
        });

        Self {
            inner,
            heartbeat: Mutex::new(Some(handle)),
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatedContainer {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[async_trait]
impl Container for HeartbeatedContainer {
    fn handle(&self) -> &str {
        self.inner.handle()
    }

    async fn run(&self, spec: ProcessSpec) -> Result<Box<dyn Process>> {
        self.inner.run(spec).await
    }

    async fn attach(&self, pid: u32) -> Result<Box<dyn Process>> {
        self.inner.attach(pid).await
    }

    async fn property(&self, name: &str) -> Result<String> {
        self.inner.property(name).await
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.inner.set_property(name, value).await
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        self.inner.stop(kill).await
    }

    async fn destroy(&self) -> Result<()> {
        self.stop_heartbeat();
        self.inner.destroy().await
    }

    async fn stream_out(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.stream_out(path).await
    }

    async fn stream_in(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.stream_in(path, data).await
    }

    fn release(&self) {
        self.stop_heartbeat();
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingContainer {
        keepalives: AtomicUsize,
    }

    #[async_trait]
    impl Container for CountingContainer {
        fn handle(&self) -> &str {
            "some-handle"
        }

        async fn run(&self, _spec: ProcessSpec) -> Result<Box<dyn Process>> {
            Err(Error::Internal("not runnable".to_string()))
        }

        async fn attach(&self, _pid: u32) -> Result<Box<dyn Process>> {
            Err(Error::Internal("not attachable".to_string()))
        }

        async fn property(&self, name: &str) -> Result<String> {
            Err(Error::Internal(format!("no property {name}")))
        }

        async fn set_property(&self, name: &str, _value: &str) -> Result<()> {
            if name == PROPERTY_KEEPALIVE {
                self.keepalives.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn stop(&self, _kill: bool) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn stream_out(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn stream_in(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn release(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_until_released() {
        let counting = Arc::new(CountingContainer::default());
        let container =
            HeartbeatedContainer::start(counting.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(counting.keepalives.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counting.keepalives.load(Ordering::SeqCst), 2);

        container.release();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(counting.keepalives.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent() {
        let counting = Arc::new(CountingContainer::default());
        let container =
            HeartbeatedContainer::start(counting.clone(), Duration::from_secs(30));

        container.release();
        container.release();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counting.keepalives.load(Ordering::SeqCst), 0);
    }
}
