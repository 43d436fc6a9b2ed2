//! Tracing subscriber setup for the binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber. `RUST_LOG` wins over the configured
/// level so operators can crank verbosity without touching config files.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
