//! Logging setup.
//!
//! stdout carries the result document, so logs go to stderr, uncoloured.
//! Filter precedence: `CALICO_CNI_LOG` > `log_level` from the network
//! configuration > `info`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::constants::LOG_FILTER_ENV;

/// Default filter when neither the environment nor the configuration sets one.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Picks the filter directive. Invalid directives fall through to the next
/// source.
#[must_use]
pub fn select_filter(env_filter: Option<&str>, config_level: Option<&str>) -> EnvFilter {
    [env_filter, config_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init(config_level: Option<&str>) {
    let env = std::env::var(LOG_FILTER_ENV).ok();
    let filter = select_filter(env.as_deref(), config_level);

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
