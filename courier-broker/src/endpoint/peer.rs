use super::{ServerConnection, ServerConnectionFactory, ServerCore};
use crate::{
    cluster_view::ClusterView, config::BrokerConfig, destination::DestinationManager,
    registry::EndpointRegistry, store::MessageStore, transaction::TransactionRepository,
};
use courier_core::{types::ConnectionId, Error, Result, ServerId};
use courier_storage::{Environment, PersistenceManager};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, warn};

/// One broker node.
///
/// Destinations are deployed on the node before [`ServerPeer::start`], which
/// recovers in-doubt transactions and begins accepting connections. Several
/// peers may share one storage environment to model a shared-store backup.
#[derive(Clone)]
pub struct ServerPeer {
    core: Arc<ServerCore>,
    env: Arc<dyn Environment>,
    started: Arc<AtomicBool>,
}

impl ServerPeer {
    /// Create a node over `env`, starting the environment if needed.
    ///
    /// # Errors
    /// `Configuration` for invalid settings, `Storage` when the environment
    /// cannot be started.
    pub fn new(config: &BrokerConfig, env: Arc<dyn Environment>, cluster_view: ClusterView) -> Result<Self> {
        config.validate_all()?;
        if !env.is_started() {
            env.start()?;
        }
        let pm = PersistenceManager::new(Arc::clone(&env));
        let store = MessageStore::new();
        let server_id = config.server_id();
        let core = ServerCore {
            server_id,
            destinations: DestinationManager::new(store, pm.clone(), config.channel_config()),
            transactions: TransactionRepository::new(pm),
            registry: EndpointRegistry::new(server_id),
            cluster_view,
        };
        Ok(Self { core: Arc::new(core), env, started: Arc::new(AtomicBool::new(false)) })
    }

    /// Node id.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.core.server_id
    }

    /// Whether the node accepts connections.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Queues, topics and subscriptions of this node.
    #[must_use]
    pub fn destinations(&self) -> &DestinationManager {
        &self.core.destinations
    }

    /// Server transactions of this node.
    #[must_use]
    pub fn transactions(&self) -> &TransactionRepository {
        &self.core.transactions
    }

    /// Live endpoints of this node.
    #[must_use]
    pub fn registry(&self) -> &EndpointRegistry {
        &self.core.registry
    }

    /// Failover record shared with the rest of the cluster.
    #[must_use]
    pub fn cluster_view(&self) -> &ClusterView {
        &self.core.cluster_view
    }

    /// Storage environment of this node.
    #[must_use]
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    /// Factory handing out connections to this node.
    #[must_use]
    pub fn connection_factory(&self) -> ServerConnectionFactory {
        ServerConnectionFactory::new(self.clone())
    }

    /// Recover in-doubt transactions and start accepting connections.
    ///
    /// # Errors
    /// `IllegalState` when already started, `Storage` when recovery fails.
    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::illegal_state(format!("server {} is already started", self.server_id())));
        }
        let recovered = self.core.transactions.recover(&self.core.destinations)?;
        self.started.store(true, Ordering::Release);
        info!(server_id = %self.server_id(), recovered, "Server started");
        Ok(())
    }

    /// Record that this node took over the clients of `failed`.
    pub fn take_over(&self, failed: ServerId) {
        self.core.cluster_view.record_failover(failed, self.server_id());
    }

    /// Kill the node: every live connection fails with a transport fault and
    /// no further server state is touched.
    pub fn crash(&self) {
        self.started.store(false, Ordering::Release);
        let cause = Error::connection_fault(format!("server {} crashed", self.server_id()));
        let connections = self.core.registry.connections();
        warn!(server_id = %self.server_id(), connections = connections.len(), "Server crashed");
        for connection in connections {
            connection.fail(&cause);
        }
        self.core.registry.clear();
    }

    /// Close every connection and stop accepting new ones.
    ///
    /// # Errors
    /// The first error raised while closing connections; the node is stopped
    /// regardless.
    pub fn shutdown(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        let mut first_error = None;
        for connection in self.core.registry.connections() {
            if let Err(err) = connection.close_connection() {
                warn!(connection = %connection.id(), %err, "Failed to close connection");
                first_error.get_or_insert(err);
            }
        }
        self.core.registry.clear();
        info!(server_id = %self.server_id(), "Server stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn open_connection(&self, username: Option<&str>) -> Result<Arc<ServerConnection>> {
        if !self.is_started() {
            return Err(Error::connection_fault(format!("server {} is not running", self.server_id())));
        }
        let id = ConnectionId::new(self.core.registry.next_id());
        let connection = ServerConnection::new(id, Arc::clone(&self.core), username.map(str::to_string));
        self.core.registry.add_connection(Arc::clone(&connection));
        info!(server_id = %self.server_id(), connection = %id, "Opened connection");
        Ok(connection)
    }
}

impl fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPeer")
            .field("server_id", &self.core.server_id)
            .field("started", &self.is_started())
            .field("registry", &self.core.registry)
            .finish()
    }
}
