//! Shared record of which node took over which.

use courier_core::ServerId;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// Which server took over the connections of a failed server.
///
/// Cloned handles share the same view, so every node of an in-process
/// cluster answers failover requests consistently.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    takeovers: Arc<RwLock<HashMap<ServerId, ServerId>>>,
}

impl ClusterView {
    /// Empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `new_server` now serves the clients of `failed`.
    pub fn record_failover(&self, failed: ServerId, new_server: ServerId) {
        self.takeovers.write().insert(failed, new_server);
        info!(%failed, %new_server, "Recorded failover");
    }

    /// Server that took over `failed`, if any.
    #[must_use]
    pub fn failover_node_for(&self, failed: ServerId) -> Option<ServerId> {
        self.takeovers.read().get(&failed).copied()
    }

    /// Forget a takeover, e.g. once the failed node is back.
    pub fn clear(&self, failed: ServerId) {
        self.takeovers.write().remove(&failed);
    }
}
