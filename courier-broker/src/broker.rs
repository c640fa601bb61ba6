//! Broker lifecycle wrapper around a single in-VM node.

use crate::{
    channel::Channel,
    cluster_view::ClusterView,
    config::BrokerConfig,
    endpoint::{ServerConnectionFactory, ServerPeer},
};
use courier_core::{Error, Message, Result};
use courier_storage::{Environment, MemoryEnvironment};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// A broker node together with its running state.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    peer: ServerPeer,
    state: Arc<RwLock<BrokerState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    running: bool,
}

impl Broker {
    /// Create a broker over a fresh in-memory environment.
    ///
    /// # Errors
    /// `Configuration` for invalid settings.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_environment(config, Arc::new(MemoryEnvironment::new()), ClusterView::new())
    }

    /// Create a broker over an existing environment and cluster view.
    ///
    /// # Errors
    /// `Configuration` for invalid settings, `Storage` when the environment
    /// cannot be started.
    pub fn with_environment(
        config: BrokerConfig,
        env: Arc<dyn Environment>,
        cluster_view: ClusterView,
    ) -> Result<Self> {
        let peer = ServerPeer::new(&config, env, cluster_view)?;
        Ok(Self { config, peer, state: Arc::new(RwLock::new(BrokerState::default())) })
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The node behind this broker.
    #[must_use]
    pub fn peer(&self) -> &ServerPeer {
        &self.peer
    }

    /// Deploy a queue.
    ///
    /// # Errors
    /// As [`crate::DestinationManager::create_queue`].
    pub fn create_queue(&self, name: &str) -> Result<Channel> {
        self.peer.destinations().create_queue(name)
    }

    /// Deploy a topic.
    ///
    /// # Errors
    /// As [`crate::DestinationManager::create_topic`].
    pub fn create_topic(&self, name: &str) -> Result<()> {
        self.peer.destinations().create_topic(name)
    }

    /// Start the broker.
    ///
    /// # Errors
    /// `IllegalState` when already running, recovery errors otherwise.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.running {
            return Err(Error::illegal_state("broker is already running"));
        }
        self.peer.start()?;
        state.running = true;
        info!(server_id = %self.peer.server_id(), "Broker running");
        Ok(())
    }

    /// Stop the broker gracefully.
    ///
    /// # Errors
    /// The first error raised while closing connections.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.running {
            return Ok(());
        }
        state.running = false;
        self.peer.shutdown()
    }

    /// Factory for in-VM client connections.
    #[must_use]
    pub fn connection_factory(&self) -> ServerConnectionFactory {
        self.peer.connection_factory()
    }

    /// Route a message outside any connection.
    ///
    /// # Errors
    /// `IllegalState` when not running, routing errors otherwise.
    pub async fn publish(&self, message: Message) -> Result<usize> {
        if !self.state.read().await.running {
            return Err(Error::illegal_state("broker is not running"));
        }
        self.peer.destinations().route(message, None)
    }

    /// Current broker statistics.
    pub async fn stats(&self) -> BrokerStats {
        let running = self.state.read().await.running;
        let destinations = self.peer.destinations();
        let channels = destinations.channels();
        BrokerStats {
            running,
            connection_count: self.peer.registry().connection_count(),
            consumer_count: self.peer.registry().consumer_count(),
            queue_count: destinations.queue_names().len(),
            topic_count: destinations.topic_names().len(),
            message_count: channels.iter().map(Channel::message_count).sum(),
            paged_count: channels.iter().map(Channel::paged_count).sum(),
            cached_bodies: destinations.store().size(),
        }
    }
}

/// Broker runtime statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    /// Whether the broker is currently running
    pub running: bool,
    /// Number of live connections
    pub connection_count: usize,
    /// Number of live consumers
    pub consumer_count: usize,
    /// Number of deployed queues
    pub queue_count: usize,
    /// Number of deployed topics
    pub topic_count: usize,
    /// References held by all channels
    pub message_count: usize,
    /// References held only in storage
    pub paged_count: usize,
    /// Distinct message bodies cached in memory
    pub cached_bodies: usize,
}
