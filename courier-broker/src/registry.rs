//! Lookup table from endpoint ids to live server endpoints.
//!
//! One registry exists per server node. It is created with the node,
//! endpoints add themselves on creation and remove themselves on close, and
//! the node clears it on shutdown.

use crate::endpoint::{ServerConnection, ServerConsumer, ServerSession};
use courier_core::{
    types::{ConnectionId, ConsumerId, SessionId},
    ServerId,
};
use dashmap::DashMap;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

const COUNTER_BITS: u32 = 48;

/// Live server endpoints of one node.
pub struct EndpointRegistry {
    server_id: ServerId,
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Arc<ServerConnection>>,
    sessions: DashMap<SessionId, Arc<ServerSession>>,
    consumers: DashMap<ConsumerId, Arc<ServerConsumer>>,
}

impl EndpointRegistry {
    /// Empty registry for `server_id`.
    #[must_use]
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            sessions: DashMap::new(),
            consumers: DashMap::new(),
        }
    }

    /// Next endpoint id. Ids embed the server id, so they never collide
    /// across the nodes of a cluster.
    pub fn next_id(&self) -> u64 {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed);
        (u64::from(self.server_id.value()) << COUNTER_BITS) | counter
    }

    pub(crate) fn add_connection(&self, connection: Arc<ServerConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub(crate) fn add_session(&self, session: Arc<ServerSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn remove_session(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    pub(crate) fn add_consumer(&self, consumer: Arc<ServerConsumer>) {
        self.consumers.insert(consumer.id(), consumer);
    }

    pub(crate) fn remove_consumer(&self, id: ConsumerId) {
        self.consumers.remove(&id);
    }

    /// Live connection by id.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ServerConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(&c))
    }

    /// Live session by id.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        self.sessions.get(&id).map(|s| Arc::clone(&s))
    }

    /// Live consumer by id.
    #[must_use]
    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<ServerConsumer>> {
        self.consumers.get(&id).map(|c| Arc::clone(&c))
    }

    /// Every live connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of live consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.consumers.clear();
        self.sessions.clear();
        self.connections.clear();
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("server_id", &self.server_id)
            .field("connections", &self.connections.len())
            .field("sessions", &self.sessions.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}
