//! Test helper functions.

use std::future::Future;
use std::time::Duration;

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Asserts that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_immediate() {
        assert!(
            wait_for(
                Duration::from_secs(1),
                Duration::from_millis(10),
                || async { true },
            )
            .await
        );
    }

    #[tokio::test]
    async fn wait_for_timeout() {
        assert!(
            !wait_for(
                Duration::from_millis(100),
                Duration::from_millis(10),
                || async { false },
            )
            .await
        );
    }
}
