//! # Courier Broker
//!
//! The server half of Courier: channels that keep a bounded window of message
//! references in memory and page the rest to storage, deliveries and
//! acknowledgements, local and two-phase transactions with crash recovery,
//! destinations and subscriptions, and in-VM endpoints implementing the
//! delegate traits from `courier-core`.
//!
//! ## Architecture
//!
//! - [`store`]: reference-counted message body cache
//! - [`channel`]: the paging engine
//! - [`delivery`]: in-flight delivery handles
//! - [`transaction`]: server transactions and the transaction repository
//! - [`destination`]: queues, topics, durable subscriptions
//! - [`endpoint`]: server peer, connection factory and endpoints
//! - [`broker`]: lifecycle wrapper
//!
//! ## Example
//!
//! ```rust
//! use courier_broker::{Broker, BrokerConfig};
//!
//! # async fn example() -> courier_core::Result<()> {
//! let broker = Broker::new(BrokerConfig::default())?;
//! broker.create_queue("orders")?;
//! broker.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod channel;
pub mod cluster_view;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod endpoint;
pub mod receiver;
pub mod registry;
pub mod selector;
pub mod store;
pub mod transaction;

pub use broker::{Broker, BrokerStats};
pub use channel::{Channel, ChannelConfig, ChannelCounts};
pub use cluster_view::ClusterView;
pub use config::BrokerConfig;
pub use delivery::Delivery;
pub use destination::{DestinationManager, Subscription, ORIGIN_PROPERTY};
pub use endpoint::{
    ServerBrowser, ServerConnection, ServerConnectionFactory, ServerConsumer, ServerPeer,
    ServerProducer, ServerSession,
};
pub use receiver::{Offer, Receiver};
pub use registry::EndpointRegistry;
pub use selector::{Filter, Selector};
pub use store::{MessageReference, MessageStore};
pub use transaction::{Transaction, TransactionRepository, TransactionState};
pub use courier_core::{Error, Result};
