//! Logging initialization for tests and examples.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the host application's job. Tests use [`init_test_logging`] so a
//! failing run can be rerun with `RUST_LOG=cancelkit=trace` for detail.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a stderr subscriber once per process. Safe to call from every
/// test; later calls are no-ops.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cancelkit=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}
