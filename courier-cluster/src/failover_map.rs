//! Static failover assignments between cluster nodes.

use courier_core::ServerId;
use std::collections::HashMap;

/// Which node takes over the clients of a failed node.
///
/// Fixed per deployment; the coordinator only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverMap {
    backups: HashMap<ServerId, ServerId>,
}

impl FailoverMap {
    /// Map without assignments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node fails over to the next one in `nodes`, the last to the first.
    /// A single node has nowhere to fail over to.
    #[must_use]
    pub fn ring(nodes: &[ServerId]) -> Self {
        if nodes.len() < 2 {
            return Self::new();
        }
        nodes.iter().zip(nodes.iter().cycle().skip(1)).map(|(failed, backup)| (*failed, *backup)).collect()
    }

    /// Assign `backup` to take over from `failed`.
    #[must_use]
    pub fn with(mut self, failed: ServerId, backup: ServerId) -> Self {
        self.backups.insert(failed, backup);
        self
    }

    /// Designated backup of `failed`.
    #[must_use]
    pub fn failover_for(&self, failed: ServerId) -> Option<ServerId> {
        self.backups.get(&failed).copied()
    }

    /// Number of assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backups.len()
    }

    /// Whether no node has a backup.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}

impl FromIterator<(ServerId, ServerId)> for FailoverMap {
    fn from_iter<I: IntoIterator<Item = (ServerId, ServerId)>>(iter: I) -> Self {
        Self { backups: iter.into_iter().collect() }
    }
}
