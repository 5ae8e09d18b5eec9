//! Tracing setup for processes embedding the engine.
//!
//! [`AnalyticsServiceBuilder::build`](crate::AnalyticsServiceBuilder::build)
//! installs the subscriber from [`LoggingConfig`] unless
//! `logging.install_subscriber` is off. The filter stays reloadable so an
//! operator can change the level without a restart.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::{ConfigError, LoggingConfig, check_log_level};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Install the global subscriber: `RUST_LOG` if set, otherwise
/// `logging.level`.
///
/// Returns `false` if a subscriber was already installed, by an earlier call
/// or by the host process.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    if FILTER.get().is_some() {
        return false;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let (filter, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
    }
    installed
}

/// Replace the active filter with `level`.
///
/// Returns `Ok(false)` if the subscriber was not installed by
/// [`init_tracing`], in which case nothing changes.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` for an unknown level.
pub fn set_log_level(level: &str) -> Result<bool, ConfigError> {
    check_log_level(level)?;
    let Some(handle) = FILTER.get() else {
        return Ok(false);
    };
    handle
        .modify(|filter| *filter = EnvFilter::new(level))
        .map_err(|e| ConfigError::invalid(format!("logging.level: {e}")))?;
    tracing::info!(level, "Log level changed");
    Ok(true)
}
