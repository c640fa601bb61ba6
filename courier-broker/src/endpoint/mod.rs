//! # In-VM server endpoints
//!
//! Server-side implementations of the delegate traits. A [`ServerPeer`] is
//! one broker node; its [`ServerConnectionFactory`] hands out
//! [`ServerConnection`]s, which own sessions, which own consumers, producers
//! and browsers. Calls are plain async method calls on shared objects, so a
//! client in the same process talks to the node without a transport.

mod browser;
mod connection;
mod consumer;
mod factory;
mod peer;
mod producer;
mod session;

pub use browser::ServerBrowser;
pub use connection::ServerConnection;
pub use consumer::ServerConsumer;
pub use factory::ServerConnectionFactory;
pub use peer::ServerPeer;
pub use producer::ServerProducer;
pub use session::ServerSession;

use crate::{
    cluster_view::ClusterView, destination::DestinationManager, registry::EndpointRegistry,
    transaction::TransactionRepository,
};
use courier_core::{
    delegate::DeliveryListener, types::ConnectionId, Error, Message, Result, ServerId,
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::destination::ORIGIN_PROPERTY;

/// Node-wide services every endpoint reaches.
pub(crate) struct ServerCore {
    pub(crate) server_id: ServerId,
    pub(crate) destinations: DestinationManager,
    pub(crate) transactions: TransactionRepository,
    pub(crate) registry: EndpointRegistry,
    pub(crate) cluster_view: ClusterView,
}

/// Connection-level state shared with the connection's sessions and
/// consumers.
pub(crate) struct ConnectionContext {
    id: ConnectionId,
    started: AtomicBool,
    closed: AtomicBool,
    failed: AtomicBool,
    client_id: RwLock<Option<String>>,
    listener: RwLock<Option<Arc<dyn DeliveryListener>>>,
}

impl ConnectionContext {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            client_id: RwLock::new(None),
            listener: RwLock::new(None),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn DeliveryListener>> {
        self.listener.read().clone()
    }

    /// Fails calls on a dead or closed connection.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::connection_fault(format!("connection {} has failed", self.id)));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::illegal_state(format!("connection {} is closed", self.id)));
        }
        Ok(())
    }

    /// Record the sending connection so no-local subscriptions can skip it.
    pub(crate) fn stamp(&self, mut message: Message) -> Message {
        message.properties.insert(ORIGIN_PROPERTY.to_string(), self.id.to_string());
        message
    }
}
