//! Development-time tracing.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Product state
//! (store tables, project documents) is written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber: `RUST_LOG` filter (default `warn`),
/// compact format on stderr.
///
/// ```bash
/// RUST_LOG=autopilot=debug autopilot status .
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
