//! Default `tracing` subscriber setup.
//!
//! Hosts embedding the originator usually install their own subscriber; this
//! helper exists for binaries and tests that want a sensible default.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a compact fmt subscriber filtered by `ORIGINATOR_LOG` (falling
/// back to `info`). Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("ORIGINATOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false))
        .try_init();
}
