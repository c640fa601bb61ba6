//! Logging bootstrap.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and a `fmt`
//! layer. `RUST_LOG` takes precedence over the configured level.

use crate::{
    config::{LogFormat, LoggingConfig},
    Error, Result,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber described by `config`.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is not
/// an error: tests and embedding applications routinely initialise twice.
///
/// # Errors
/// Returns [`Error::Configuration`] if the level directive cannot be parsed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| Error::Configuration {
            message: format!("invalid log level '{}': {e}", config.level),
        })?,
    };

    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .boxed(),
    };

    let installed =
        tracing_subscriber::registry().with(fmt_layer.with_filter(filter)).try_init().is_ok();
    if installed {
        tracing::info!(level = %config.level, format = ?config.format, "Logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert_eq!(init(&config).ok(), Some(false));
    }
}
