//! # Courier Cluster
//!
//! Client-side high availability for Courier: a connection factory that
//! spreads connections over the nodes of a cluster, and a coordinator that
//! moves a connection to the node that took over its failed server.
//!
//! ## Failover
//!
//! When the transport of a watched connection fails, the coordinator asks
//! the failed server's backup from the [`FailoverMap`] for a connection. A
//! server that did not take over names the one that did, and the coordinator
//! follows such redirects for at most [`MAX_RECONNECT_HOP_COUNT`] connection
//! attempts. Once connected it recreates every open session with its
//! producers, consumers and browsers, swaps the new server endpoints in under
//! the application's handles and resends the unacknowledged persistent
//! deliveries. Non-persistent deliveries did not survive and are dropped.
//!
//! ## Example
//!
//! ```rust
//! use courier_broker::{Broker, BrokerConfig};
//! use courier_cluster::{ClusteredConnectionFactory, FailoverMap};
//! use courier_core::{config::ClientConfig, delegate::ConnectionFactoryDelegate, ServerId};
//! use std::sync::Arc;
//!
//! # async fn example() -> courier_core::Result<()> {
//! let first = Broker::new(BrokerConfig::default().with_server_id(1))?;
//! let second = Broker::new(BrokerConfig::default().with_server_id(2))?;
//! first.start().await?;
//! second.start().await?;
//!
//! let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> =
//!     vec![Arc::new(first.connection_factory()), Arc::new(second.connection_factory())];
//! let map = FailoverMap::ring(&[ServerId::new(1), ServerId::new(2)]);
//! let factory = ClusteredConnectionFactory::new(factories, map, ClientConfig::default())?;
//!
//! let connection = factory.create_connection(None, None).await?;
//! connection.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod factory;
pub mod failover_map;

pub use coordinator::{FailoverCoordinator, FailoverEvent, FailoverOutcome, MAX_RECONNECT_HOP_COUNT};
pub use courier_core::{Error, Result};
pub use factory::ClusteredConnectionFactory;
pub use failover_map::FailoverMap;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ClusteredConnectionFactory, FailoverCoordinator, FailoverEvent, FailoverMap, FailoverOutcome,
        MAX_RECONNECT_HOP_COUNT,
    };
    pub use courier_client::prelude::*;
}
