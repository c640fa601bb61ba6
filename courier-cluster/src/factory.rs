//! Connection factory spanning several cluster nodes.

use crate::{coordinator::FailoverCoordinator, failover_map::FailoverMap};
use courier_client::ClientConnection;
use courier_core::{config::ClientConfig, delegate::ConnectionFactoryDelegate, Error, Result};
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Hands out connections round-robin across the nodes of a cluster and
/// watches every one of them for failover.
pub struct ClusteredConnectionFactory {
    factories: Vec<Arc<dyn ConnectionFactoryDelegate>>,
    next: AtomicUsize,
    config: ClientConfig,
    coordinator: FailoverCoordinator,
}

impl ClusteredConnectionFactory {
    /// Factory over one connection factory per node.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] without any factory or outside a tokio runtime.
    pub fn new(
        factories: Vec<Arc<dyn ConnectionFactoryDelegate>>,
        map: FailoverMap,
        config: ClientConfig,
    ) -> Result<Self> {
        if factories.is_empty() {
            return Err(Error::Configuration { message: "a clustered factory needs at least one server".to_string() });
        }
        let coordinator = FailoverCoordinator::new(&factories, map)?;
        Ok(Self { factories, next: AtomicUsize::new(0), config, coordinator })
    }

    /// Number of nodes connections are spread over.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.factories.len()
    }

    /// The coordinator failing over connections of this factory.
    #[must_use]
    pub fn coordinator(&self) -> &FailoverCoordinator {
        &self.coordinator
    }

    /// Open a connection on the next node in turn.
    ///
    /// # Errors
    /// Returns the node's error; the following call moves on to the next node.
    pub async fn create_connection(&self, username: Option<&str>, password: Option<&str>) -> Result<ClientConnection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.factories.len();
        let factory = &self.factories[index];
        debug!(server_id = %factory.server_id(), index, "Creating clustered connection");
        let connection = ClientConnection::connect(factory.as_ref(), username, password, self.config.clone()).await?;
        self.coordinator.watch(&connection);
        Ok(connection)
    }
}

impl fmt::Debug for ClusteredConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusteredConnectionFactory")
            .field("servers", &self.factories.iter().map(|f| f.server_id()).collect::<Vec<_>>())
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}
