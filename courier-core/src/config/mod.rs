//! # Configuration
//!
//! Layered broker configuration: defaults, then a TOML file, then `COURIER_`
//! environment overrides. Field ranges are checked with `validator`; rules
//! spanning several fields live in [`CourierConfig::validate_all`].

pub mod loader;

pub use loader::ConfigLoader;

use crate::{types::ServerId, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CourierConfig {
    /// Broker node settings
    #[validate(nested)]
    pub server: ServerConfig,

    /// Default paging bounds for new channels
    #[validate(nested)]
    pub paging: PagingConfig,

    /// Client behaviour
    #[validate(nested)]
    pub client: ClientConfig,

    /// Logging output
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl CourierConfig {
    /// Run field-level and cross-field validation.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first violated rule.
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        self.paging.check_bounds()
    }
}

/// Broker node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Identifier of this node in the cluster
    pub server_id: u32,

    /// Whether queue channels persist reliable references
    pub recoverable: bool,
}

impl ServerConfig {
    /// Typed server id.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.server_id)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { server_id: 0, recoverable: true }
    }
}

/// Paging bounds of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PagingConfig {
    /// Maximum references held in memory before overflow goes to storage
    #[validate(range(min = 1, max = 10_000_000))]
    pub full_size: usize,

    /// References loaded back from storage per batch
    #[validate(range(min = 1))]
    pub page_size: usize,

    /// Overflow references buffered before a batched write
    #[validate(range(min = 1))]
    pub down_cache_size: usize,
}

impl PagingConfig {
    /// Create paging bounds.
    #[must_use]
    pub const fn new(full_size: usize, page_size: usize, down_cache_size: usize) -> Self {
        Self { full_size, page_size, down_cache_size }
    }

    /// Cross-field rules: `0 < down_cache_size <= page_size <= full_size`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when a rule is broken.
    pub fn check_bounds(&self) -> Result<()> {
        if self.full_size == 0 || self.page_size == 0 || self.down_cache_size == 0 {
            return Err(Error::Configuration {
                message: "paging sizes must be greater than zero".to_string(),
            });
        }
        if self.page_size > self.full_size {
            return Err(Error::Configuration {
                message: format!(
                    "paging.page_size ({}) must not exceed paging.full_size ({})",
                    self.page_size, self.full_size
                ),
            });
        }
        if self.down_cache_size > self.page_size {
            return Err(Error::Configuration {
                message: format!(
                    "paging.down_cache_size ({}) must not exceed paging.page_size ({})",
                    self.down_cache_size, self.page_size
                ),
            });
        }
        Ok(())
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self { full_size: 75_000, page_size: 2_000, down_cache_size: 2_000 }
    }
}

/// Client behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Receive timeout used when the application passes none, in milliseconds
    #[validate(range(min = 1, max = 3_600_000))]
    pub default_receive_timeout_ms: u64,
}

impl ClientConfig {
    /// Default receive timeout as a [`Duration`].
    #[must_use]
    pub fn default_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.default_receive_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { default_receive_timeout_ms: 30_000 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CourierConfig::default().validate_all().is_ok());
    }

    #[test]
    fn test_page_size_above_full_size_rejected() {
        let mut config = CourierConfig::default();
        config.paging = PagingConfig::new(10, 20, 5);
        assert!(matches!(config.validate_all(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_down_cache_above_page_size_rejected() {
        assert!(PagingConfig::new(100, 20, 30).check_bounds().is_err());
        assert!(PagingConfig::new(100, 20, 10).check_bounds().is_ok());
    }

    #[test]
    fn test_zero_full_size_rejected_by_validator() {
        let mut config = CourierConfig::default();
        config.paging.full_size = 0;
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_receive_timeout_conversion() {
        let client = ClientConfig { default_receive_timeout_ms: 250 };
        assert_eq!(client.default_receive_timeout(), Duration::from_millis(250));
    }
}
