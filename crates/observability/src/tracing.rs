//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize JSON tracing for a Tidemark process.
///
/// Safe to call multiple times (subsequent calls are no-ops). The filter
/// comes from `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("info"))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact, capture-friendly setup for test binaries.
///
/// Output goes through the test writer, so `cargo test` shows it only for
/// failing tests. Defaults to `warn` to keep watcher/worker chatter down
/// while leases and retries churn.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .compact()
        .with_test_writer()
        .try_init();
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
