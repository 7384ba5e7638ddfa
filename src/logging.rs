//! Structured logging setup. Mirrors the shape of the teacher binary's own
//! `tracing_subscriber` initialization: an `EnvFilter` seeded from
//! `RUST_LOG` (falling back to a sensible default), plain text output, and
//! an explicit `tracing::info!` once logging itself is live.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber. Call once, near the top of
/// `main`, before anything else logs.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    tracing::info!("logging initialized");
}
