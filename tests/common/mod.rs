//! Shared helpers for integration tests.

#![allow(dead_code)]

use cotask::{Error, Scope};

use std::sync::Once;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Installs a `tracing` subscriber writing through the test harness, once per binary.
///
/// Verbosity follows `RUST_LOG` and defaults to `cotask=debug`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cotask=debug"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Suspends on `scope` for `secs` seconds of virtual time, then returns `value`.
pub async fn delayed<T>(scope: Scope, secs: u64, value: T) -> Result<T, Error> {
    scope.delay(Duration::from_secs(secs)).await;
    Ok(value)
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
