//! Process-wide log subscriber.
//!
//! Library code only emits `tracing` events. The binaries call [`init`] once
//! at startup; tests run without a subscriber.

use tracing_subscriber::EnvFilter;

/// JSON logs with timestamps, filtered through `RUST_LOG` (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
