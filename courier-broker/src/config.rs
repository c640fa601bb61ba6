//! Broker configuration types.

use courier_core::{
    config::{PagingConfig, ServerConfig},
    CourierConfig, Result, ServerId,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::channel::ChannelConfig;

/// Configuration for one broker node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BrokerConfig {
    /// Node identity and durability
    #[validate(nested)]
    pub server: ServerConfig,

    /// Paging bounds applied to every channel
    #[validate(nested)]
    pub paging: PagingConfig,
}

impl BrokerConfig {
    /// Set the server id.
    #[must_use]
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server.server_id = server_id;
        self
    }

    /// Set the paging bounds.
    #[must_use]
    pub fn with_paging(mut self, paging: PagingConfig) -> Self {
        self.paging = paging;
        self
    }

    /// Choose whether persistent references survive a restart.
    #[must_use]
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.server.recoverable = recoverable;
        self
    }

    /// Typed server id.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.server.server_id()
    }

    /// Settings for channels created by this node.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.paging, self.server.recoverable)
    }

    /// Field and cross-field validation.
    ///
    /// # Errors
    /// `Configuration` describing the first violated rule.
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        self.paging.check_bounds()
    }
}

impl From<&CourierConfig> for BrokerConfig {
    fn from(config: &CourierConfig) -> Self {
        Self { server: config.server.clone(), paging: config.paging }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = BrokerConfig::default()
            .with_server_id(3)
            .with_paging(PagingConfig::new(100, 20, 10))
            .with_recoverable(false);
        assert_eq!(config.server_id(), ServerId::new(3));
        assert_eq!(config.channel_config(), ChannelConfig::new(PagingConfig::new(100, 20, 10), false));
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn test_rejects_inverted_paging_bounds() {
        let config = BrokerConfig::default().with_paging(PagingConfig::new(10, 20, 5));
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_from_courier_config() {
        let mut courier = CourierConfig::default();
        courier.server.server_id = 9;
        courier.paging = PagingConfig::new(50, 10, 5);
        let config = BrokerConfig::from(&courier);
        assert_eq!(config.server_id(), ServerId::new(9));
        assert_eq!(config.paging.full_size, 50);
    }
}
