//! Structured logging setup via tracing-subscriber.
//!
//! The filter is read from `SEALFS_LOG` (e.g. `sealfs_engine=debug`) and
//! falls back to the level passed by the caller.

use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "SEALFS_LOG";

/// Installs a global fmt subscriber. Returns `false` if one was already set.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}
