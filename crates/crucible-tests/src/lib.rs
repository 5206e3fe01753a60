//! Shared infrastructure for Crucible integration tests.

pub mod containers;
pub mod context;
pub mod helpers;

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests (only once).
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "crucible=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
