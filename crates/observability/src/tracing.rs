//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Default directives when `RUST_LOG` is unset: quiet overall, but keep the
/// sync lifecycle visible.
const DEFAULT_FILTER: &str = "info,scanstock_sync=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize human-readable logging for an interactive client process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

/// Initialize JSON logging, for runs whose output is shipped to a collector.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_json() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
