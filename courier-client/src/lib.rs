//! # Courier Client
//!
//! Client half of Courier connections: application-facing connection,
//! session, consumer, producer and browser handles layered over the delegate
//! traits of `courier-core`.
//!
//! The client mirrors every endpoint it creates (ids, destinations,
//! selectors, acknowledgement mode, unacknowledged deliveries) so a failover
//! coordinator can rebuild it on another server and swap the delegates in
//! place.
//!
//! ## Architecture
//!
//! - [`connection`]: connections and exception listeners
//! - [`session`]: sessions
//! - [`endpoint`]: consumers, producers and browsers
//! - [`interceptor`]: acknowledgement-mode handling around a session
//! - [`tx`]: local transactions and XA branches
//! - [`xa`]: the XA resource of an XA session
//! - [`callback`]: per-consumer delivery buffers
//! - [`state`]: endpoint mirrors and failover states
//!
//! ## Example
//!
//! ```rust
//! use courier_broker::{Broker, BrokerConfig};
//! use courier_client::ClientConnection;
//! use courier_core::{config::ClientConfig, AckMode, Destination, Message};
//!
//! # async fn example() -> courier_core::Result<()> {
//! let broker = Broker::new(BrokerConfig::default())?;
//! broker.create_queue("orders")?;
//! broker.start().await?;
//!
//! let factory = broker.connection_factory();
//! let connection = ClientConnection::connect(&factory, None, None, ClientConfig::default()).await?;
//! let session = connection.create_session(false, AckMode::ClientAcknowledge).await?;
//! let orders = Destination::queue("orders")?;
//! let consumer = session.create_consumer(orders.clone(), None).await?;
//! session.create_producer(orders.clone()).await?.send(Message::new(orders, "hello".into())).await?;
//!
//! connection.start().await?;
//! if let Some(message) = consumer.receive(None).await? {
//!     println!("received {}", message.id);
//!     session.acknowledge().await?;
//! }
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callback;
pub mod connection;
pub mod endpoint;
pub mod interceptor;
pub mod session;
pub mod state;
pub mod tx;
pub mod xa;

pub use callback::{CallbackManager, MessageCallbackHandler};
pub use connection::{ClientConnection, ExceptionListener, WeakConnection};
pub use courier_core::{Error, Result};
pub use endpoint::{ClientBrowser, ClientConsumer, ClientProducer};
pub use interceptor::SessionInterceptor;
pub use session::ClientSession;
pub use state::{BrowserState, ConnectionState, ConsumerState, FailoverState, ProducerState, SessionState};
pub use tx::{BranchState, ResourceManager, TxKey};
pub use xa::XaResource;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ClientBrowser, ClientConnection, ClientConsumer, ClientProducer, ClientSession, ExceptionListener,
        FailoverState, XaResource,
    };
    pub use courier_core::prelude::*;
}
