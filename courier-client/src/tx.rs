//! Client-side transaction branches.
//!
//! A transacted session stages its sends and acknowledgements here until
//! commit; the whole payload then travels to the server in one request. XA
//! branches follow the `start -> end -> prepare -> commit | rollback` life
//! cycle and reject calls made out of order.

use courier_core::{
    delegate::{AckInfo, ConnectionDelegate, TransactionPayload, TransactionRequest},
    types::ConsumerId,
    Error, Message, Result, Xid,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

/// Key of a client transaction branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxKey {
    /// Local transaction of a transacted session
    Local(u64),
    /// XA branch
    Xa(Xid),
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKey::Local(id) => write!(f, "local:{id}"),
            TxKey::Xa(xid) => write!(f, "xa:{xid}"),
        }
    }
}

/// Client view of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Work may be added
    Active,
    /// Association ended; ready to prepare or commit in one phase
    Ended,
    /// Ended with failure or failed to prepare; can only be rolled back
    RollbackOnly,
    /// Prepared on the server
    Prepared,
}

#[derive(Debug)]
struct Branch {
    state: BranchState,
    payload: TransactionPayload,
}

impl Branch {
    fn active() -> Self {
        Self { state: BranchState::Active, payload: TransactionPayload::default() }
    }
}

/// Transaction branches of one client connection.
#[derive(Debug, Default)]
pub struct ResourceManager {
    branches: Mutex<HashMap<TxKey, Branch>>,
    next_local: AtomicU64,
}

impl ResourceManager {
    /// Empty resource manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new local transaction.
    pub fn create_local_tx(&self) -> TxKey {
        let key = TxKey::Local(self.next_local.fetch_add(1, Ordering::Relaxed) + 1);
        self.branches.lock().insert(key.clone(), Branch::active());
        key
    }

    /// Whether `key` names a known branch.
    #[must_use]
    pub fn contains(&self, key: &TxKey) -> bool {
        self.branches.lock().contains_key(key)
    }

    /// State of the branch, if known.
    #[must_use]
    pub fn state(&self, key: &TxKey) -> Option<BranchState> {
        self.branches.lock().get(key).map(|b| b.state)
    }

    /// Number of open branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.lock().len()
    }

    /// Whether no branch is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.lock().is_empty()
    }

    /// Stage a send.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the branch is unknown or not active.
    pub fn add_message(&self, key: &TxKey, message: Message) -> Result<()> {
        self.with_active(key, |payload| payload.sends.push(message))
    }

    /// Stage an acknowledgement.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the branch is unknown or not active.
    pub fn add_ack(&self, key: &TxKey, ack: AckInfo) -> Result<()> {
        self.with_active(key, |payload| payload.acks.push(ack))
    }

    /// Staged acknowledgements of a branch.
    #[must_use]
    pub fn acks(&self, key: &TxKey) -> Vec<AckInfo> {
        self.branches.lock().get(key).map(|b| b.payload.acks.clone()).unwrap_or_default()
    }

    /// Staged sends of a branch.
    #[must_use]
    pub fn sends(&self, key: &TxKey) -> Vec<Message> {
        self.branches.lock().get(key).map(|b| b.payload.sends.clone()).unwrap_or_default()
    }

    fn with_active(&self, key: &TxKey, stage: impl FnOnce(&mut TransactionPayload)) -> Result<()> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(key)
            .ok_or_else(|| Error::illegal_state(format!("unknown transaction {key}")))?;
        if branch.state != BranchState::Active {
            return Err(Error::illegal_state(format!("transaction {key} is {:?}", branch.state)));
        }
        stage(&mut branch.payload);
        Ok(())
    }

    /// Commit a local transaction in one phase and return its acknowledgements.
    ///
    /// The branch is gone afterwards whatever the outcome; a failed commit
    /// leaves nothing applied on the server.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for an unknown branch, or the server's
    /// error if the commit fails.
    pub async fn commit_local(&self, key: &TxKey, connection: &dyn ConnectionDelegate) -> Result<Vec<AckInfo>> {
        let branch = self.remove(key)?;
        let acks = branch.payload.acks.clone();
        if !branch.payload.is_empty() {
            connection.send_transaction(TransactionRequest::OnePhaseCommit { payload: branch.payload }).await?;
        }
        debug!(tx = %key, acks = acks.len(), "Committed local transaction");
        Ok(acks)
    }

    /// Discard a local transaction and return the acknowledgements it held.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for an unknown branch.
    pub fn rollback_local(&self, key: &TxKey) -> Result<Vec<AckInfo>> {
        let branch = self.remove(key)?;
        debug!(tx = %key, acks = branch.payload.acks.len(), "Rolled back local transaction");
        Ok(branch.payload.acks)
    }

    fn remove(&self, key: &TxKey) -> Result<Branch> {
        self.branches
            .lock()
            .remove(key)
            .ok_or_else(|| Error::illegal_state(format!("unknown transaction {key}")))
    }

    /// Start an XA branch.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the branch already exists.
    pub fn start(&self, xid: &Xid) -> Result<()> {
        let key = TxKey::Xa(xid.clone());
        let mut branches = self.branches.lock();
        if branches.contains_key(&key) {
            return Err(Error::illegal_state(format!("transaction {key} already started")));
        }
        branches.insert(key, Branch::active());
        Ok(())
    }

    /// End the association with an XA branch. A failed branch can only roll back.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the branch is unknown or not active.
    pub fn end(&self, xid: &Xid, failed: bool) -> Result<()> {
        let key = TxKey::Xa(xid.clone());
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(&key)
            .ok_or_else(|| Error::illegal_state(format!("unknown transaction {key}")))?;
        if branch.state != BranchState::Active {
            return Err(Error::illegal_state(format!("transaction {key} is {:?}", branch.state)));
        }
        branch.state = if failed { BranchState::RollbackOnly } else { BranchState::Ended };
        Ok(())
    }

    /// Prepare an ended XA branch on the server.
    ///
    /// A branch that fails to prepare becomes rollback-only.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the branch is not ended, or the
    /// server's error.
    pub async fn prepare(&self, xid: &Xid, connection: &dyn ConnectionDelegate) -> Result<()> {
        let key = TxKey::Xa(xid.clone());
        let payload = {
            let branches = self.branches.lock();
            let branch = branches
                .get(&key)
                .ok_or_else(|| Error::illegal_state(format!("unknown transaction {key}")))?;
            if branch.state != BranchState::Ended {
                return Err(Error::illegal_state(format!("cannot prepare {key} in state {:?}", branch.state)));
            }
            branch.payload.clone()
        };

        let outcome = connection.send_transaction(TransactionRequest::Prepare { xid: xid.clone(), payload }).await;
        let mut branches = self.branches.lock();
        if let Some(branch) = branches.get_mut(&key) {
            branch.state = if outcome.is_ok() { BranchState::Prepared } else { BranchState::RollbackOnly };
        }
        outcome
    }

    /// Commit an XA branch and return its acknowledgements.
    ///
    /// With `one_phase` the branch must be ended and its payload is applied in
    /// one step; otherwise it must be prepared. A branch unknown to this
    /// client (prepared before a restart) is committed on the server directly.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for calls out of order, or the server's error.
    pub async fn commit(&self, xid: &Xid, one_phase: bool, connection: &dyn ConnectionDelegate) -> Result<Vec<AckInfo>> {
        let key = TxKey::Xa(xid.clone());
        let state = self.state(&key);
        let request = match (state, one_phase) {
            (Some(BranchState::Ended), true) => {
                let payload = self.branches.lock().get(&key).map(|b| b.payload.clone()).unwrap_or_default();
                TransactionRequest::OnePhaseCommit { payload }
            },
            (Some(BranchState::Prepared), false) | (None, false) => TransactionRequest::Commit { xid: xid.clone() },
            (state, _) => {
                return Err(Error::illegal_state(format!(
                    "cannot commit {key} (one phase: {one_phase}) in state {state:?}"
                )));
            },
        };

        connection.send_transaction(request).await?;
        let acks = self.branches.lock().remove(&key).map(|b| b.payload.acks).unwrap_or_default();
        debug!(tx = %key, one_phase, "Committed XA branch");
        Ok(acks)
    }

    /// Roll back an XA branch and return the acknowledgements it held.
    ///
    /// Unprepared work is discarded locally. Prepared branches, and branches
    /// this client does not know, are rolled back on the server.
    ///
    /// # Errors
    /// Returns the server's error for a prepared or unknown branch.
    pub async fn rollback(&self, xid: &Xid, connection: &dyn ConnectionDelegate) -> Result<Vec<AckInfo>> {
        let key = TxKey::Xa(xid.clone());
        match self.state(&key) {
            Some(BranchState::Prepared) | None => {
                connection.send_transaction(TransactionRequest::Rollback { xid: xid.clone() }).await?;
            },
            Some(_) => {},
        }
        let acks = self.branches.lock().remove(&key).map(|b| b.payload.acks).unwrap_or_default();
        debug!(tx = %key, "Rolled back XA branch");
        Ok(acks)
    }

    /// Prepared branches awaiting resolution on the connection's server.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn recover(&self, connection: &dyn ConnectionDelegate) -> Result<Vec<Xid>> {
        connection.prepared_transactions().await
    }

    /// Drop staged acknowledgements of non-persistent messages delivered to `consumers`.
    pub fn remove_non_persistent_acks(&self, consumers: &HashSet<ConsumerId>) -> usize {
        let mut removed = 0;
        for branch in self.branches.lock().values_mut() {
            let before = branch.payload.acks.len();
            branch.payload.acks.retain(|ack| ack.persistent || !consumers.contains(&ack.consumer_id));
            removed += before - branch.payload.acks.len();
        }
        removed
    }

    /// Drop every staged acknowledgement for `consumer`.
    pub fn remove_acks_for_consumer(&self, consumer: ConsumerId) {
        for branch in self.branches.lock().values_mut() {
            branch.payload.acks.retain(|ack| ack.consumer_id != consumer);
        }
    }

    /// Staged acknowledgements for deliveries to `consumers`, across all branches.
    #[must_use]
    pub fn ack_infos_for_consumer_ids(&self, consumers: &HashSet<ConsumerId>) -> Vec<AckInfo> {
        self.branches
            .lock()
            .values()
            .flat_map(|b| b.payload.acks.iter())
            .filter(|ack| consumers.contains(&ack.consumer_id))
            .cloned()
            .collect()
    }

    /// Rewrite staged acknowledgements of consumer `old` to consumer `new`.
    pub fn handle_failover(&self, old: ConsumerId, new: ConsumerId) {
        let mut remapped = 0;
        for branch in self.branches.lock().values_mut() {
            for ack in branch.payload.acks.iter_mut().filter(|ack| ack.consumer_id == old) {
                ack.consumer_id = new;
                remapped += 1;
            }
        }
        if remapped > 0 {
            debug!(%old, %new, remapped, "Remapped staged acknowledgements");
        }
    }

    /// Forget every branch. Used when the connection closes.
    pub fn clear(&self) {
        let mut branches = self.branches.lock();
        if !branches.is_empty() {
            warn!(open = branches.len(), "Discarding open transaction branches");
        }
        branches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::{
        delegate::{DeliveryListener, FailureListener, SessionDelegate},
        types::ConnectionId,
        AckMode, Destination, MessageId, ServerId,
    };
    use std::sync::Arc;

    /// Records transaction requests and fails them on demand.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<TransactionRequest>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ConnectionDelegate for Recorder {
        fn server_id(&self) -> ServerId {
            ServerId::new(1)
        }

        fn connection_id(&self) -> ConnectionId {
            ConnectionId::new(1)
        }

        async fn set_client_id(&self, _client_id: &str) -> Result<()> {
            Ok(())
        }

        async fn create_session_delegate(&self, _: bool, _: AckMode, _: bool) -> Result<Arc<dyn SessionDelegate>> {
            Err(Error::illegal_state("not supported"))
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn send_transaction(&self, request: TransactionRequest) -> Result<()> {
            if *self.fail.lock() {
                return Err(Error::connection_fault("down"));
            }
            self.requests.lock().push(request);
            Ok(())
        }

        async fn prepared_transactions(&self) -> Result<Vec<Xid>> {
            Ok(Vec::new())
        }

        fn set_delivery_listener(&self, _listener: Arc<dyn DeliveryListener>) {}

        fn add_failure_listener(&self, _listener: Arc<dyn FailureListener>) {}
    }

    fn ack(consumer: u64, persistent: bool) -> AckInfo {
        AckInfo::new(MessageId::new(), ConsumerId::new(consumer), persistent)
    }

    fn message() -> Message {
        Message::new(Destination::queue("q").unwrap(), Bytes::from_static(b"x"))
    }

    #[tokio::test]
    async fn test_local_commit_ships_payload_once() {
        let rm = ResourceManager::new();
        let conn = Recorder::default();
        let tx = rm.create_local_tx();
        rm.add_message(&tx, message()).unwrap();
        rm.add_ack(&tx, ack(1, true)).unwrap();

        let acks = rm.commit_local(&tx, &conn).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert!(!rm.contains(&tx));
        assert!(rm.commit_local(&tx, &conn).await.unwrap_err().is_illegal_state());

        let requests = conn.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(matches!(&requests[0], TransactionRequest::OnePhaseCommit { payload } if payload.sends.len() == 1));
    }

    #[tokio::test]
    async fn test_empty_local_commit_skips_the_server() {
        let rm = ResourceManager::new();
        let conn = Recorder::default();
        let tx = rm.create_local_tx();
        assert!(rm.commit_local(&tx, &conn).await.unwrap().is_empty());
        assert!(conn.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_xa_lifecycle_enforces_order() {
        let rm = ResourceManager::new();
        let conn = Recorder::default();
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());

        rm.start(&xid).unwrap();
        assert!(rm.start(&xid).unwrap_err().is_illegal_state());
        rm.add_ack(&TxKey::Xa(xid.clone()), ack(1, true)).unwrap();
        assert!(rm.prepare(&xid, &conn).await.unwrap_err().is_illegal_state());
        assert!(rm.commit(&xid, true, &conn).await.unwrap_err().is_illegal_state());

        rm.end(&xid, false).unwrap();
        assert!(rm.add_ack(&TxKey::Xa(xid.clone()), ack(1, true)).unwrap_err().is_illegal_state());
        assert!(rm.commit(&xid, false, &conn).await.unwrap_err().is_illegal_state());

        rm.prepare(&xid, &conn).await.unwrap();
        assert_eq!(rm.state(&TxKey::Xa(xid.clone())), Some(BranchState::Prepared));
        assert!(rm.commit(&xid, true, &conn).await.unwrap_err().is_illegal_state());

        let acks = rm.commit(&xid, false, &conn).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert!(rm.is_empty());
        assert!(matches!(conn.requests.lock().last(), Some(TransactionRequest::Commit { .. })));
    }

    #[tokio::test]
    async fn test_failed_prepare_leaves_branch_rollback_only() {
        let rm = ResourceManager::new();
        let conn = Recorder::default();
        let xid = Xid::generate();
        rm.start(&xid).unwrap();
        rm.end(&xid, false).unwrap();

        *conn.fail.lock() = true;
        assert!(rm.prepare(&xid, &conn).await.is_err());
        assert_eq!(rm.state(&TxKey::Xa(xid.clone())), Some(BranchState::RollbackOnly));

        rm.rollback(&xid, &conn).await.unwrap();
        assert!(rm.is_empty());
        assert!(conn.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_branch_is_resolved_on_the_server() {
        let rm = ResourceManager::new();
        let conn = Recorder::default();
        let xid = Xid::generate();
        rm.commit(&xid, false, &conn).await.unwrap();
        rm.rollback(&xid, &conn).await.unwrap();
        let requests = conn.requests.lock();
        assert!(matches!(requests[0], TransactionRequest::Commit { .. }));
        assert!(matches!(requests[1], TransactionRequest::Rollback { .. }));
    }

    #[test]
    fn test_failover_rewrites_and_filters_acks() {
        let rm = ResourceManager::new();
        let tx = rm.create_local_tx();
        rm.add_ack(&tx, ack(1, true)).unwrap();
        rm.add_ack(&tx, ack(1, false)).unwrap();
        rm.add_ack(&tx, ack(2, false)).unwrap();

        let consumers: HashSet<_> = [ConsumerId::new(1)].into_iter().collect();
        assert_eq!(rm.remove_non_persistent_acks(&consumers), 1);

        rm.handle_failover(ConsumerId::new(1), ConsumerId::new(11));
        let moved: HashSet<_> = [ConsumerId::new(11)].into_iter().collect();
        let acks = rm.ack_infos_for_consumer_ids(&moved);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].persistent);
        assert_eq!(rm.acks(&tx).len(), 2);
    }
}
