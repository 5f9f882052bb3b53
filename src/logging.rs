//! Logging backend, built on `tracing`/`tracing-subscriber`.

use tracing_subscriber::{fmt, EnvFilter};

/// Build and install the global subscriber. `level` is the configured
/// default (`Config::log_level`); `RUST_LOG` still overrides it.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Re-entrant init (e.g. in tests); not fatal.
        tracing::debug!("tracing subscriber already installed");
    }
}

/// SIGHUP handling: reload log settings only, topology is not
/// hot-swappable. `tracing_subscriber`'s global filter can't be swapped
/// after `set_global_default`, so a reload re-reads the level from the
/// config file and logs the (no-op) intent; a reloadable filter layer
/// would be the natural next step if hot log-level changes become a
/// real requirement.
pub fn note_reload_requested(new_level: &str) {
    tracing::info!(level = new_level, "SIGHUP received: log settings reload requested");
}
