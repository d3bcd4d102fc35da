//! Development-time tracing.
//!
//! Tracing is diagnostics only: stderr, filtered by `RUST_LOG`. The SR, HK,
//! exit and pin artifacts under `.gate/artifacts/` are product output and are
//! written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` if `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=sessiongate=debug sessiongate reconcile sess-1
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
