use super::ServerPeer;
use async_trait::async_trait;
use courier_core::{
    delegate::{ConnectionFactoryDelegate, CreateConnectionResult},
    Error, Result, ServerId,
};
use tracing::debug;

/// Connection factory of one node.
///
/// For a failover attempt the node accepts the connection only if it took
/// over the failed server; otherwise it names the node that did, or reports
/// that no failover happened.
#[derive(Debug, Clone)]
pub struct ServerConnectionFactory {
    peer: ServerPeer,
}

impl ServerConnectionFactory {
    pub(crate) fn new(peer: ServerPeer) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl ConnectionFactoryDelegate for ServerConnectionFactory {
    fn server_id(&self) -> ServerId {
        self.peer.server_id()
    }

    async fn create_connection_delegate(
        &self,
        username: Option<&str>,
        _password: Option<&str>,
        failed_server_id: Option<ServerId>,
    ) -> Result<CreateConnectionResult> {
        if !self.peer.is_started() {
            return Err(Error::connection_fault(format!("server {} is not running", self.peer.server_id())));
        }
        let Some(failed) = failed_server_id else {
            return Ok(CreateConnectionResult::connected(self.peer.open_connection(username)?));
        };

        match self.peer.cluster_view().failover_node_for(failed) {
            Some(node) if node == self.peer.server_id() => {
                debug!(server_id = %node, %failed, "Accepting failover connection");
                Ok(CreateConnectionResult::connected(self.peer.open_connection(username)?))
            },
            Some(node) => {
                debug!(server_id = %self.peer.server_id(), %failed, actual = %node, "Redirecting failover");
                Ok(CreateConnectionResult::redirect(node))
            },
            None => Ok(CreateConnectionResult::no_failover()),
        }
    }
}
