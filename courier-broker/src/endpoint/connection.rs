use super::{ConnectionContext, ServerConsumer, ServerCore, ServerSession};
use crate::transaction::Transaction;
use async_trait::async_trait;
use courier_core::{
    delegate::{
        AckInfo, ConnectionDelegate, DeliveryListener, FailureListener, SessionDelegate,
        TransactionPayload, TransactionRequest,
    },
    types::{ConnectionId, SessionId},
    AckMode, Error, Result, ServerId, Xid,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{atomic::Ordering, Arc, Weak},
};
use tracing::{debug, error, info, warn};

/// Server side of a connection.
pub struct ServerConnection {
    me: Weak<ServerConnection>,
    core: Arc<ServerCore>,
    context: Arc<ConnectionContext>,
    username: Option<String>,
    sessions: DashMap<SessionId, Arc<ServerSession>>,
    failure_listeners: Mutex<Vec<Arc<dyn FailureListener>>>,
}

impl ServerConnection {
    pub(crate) fn new(id: ConnectionId, core: Arc<ServerCore>, username: Option<String>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            context: Arc::new(ConnectionContext::new(id)),
            username,
            sessions: DashMap::new(),
            failure_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.context.id()
    }

    /// User the connection was opened for.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Client id, once set.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.context.client_id()
    }

    /// Whether delivery is running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.context.is_started()
    }

    /// Every open session.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub(crate) fn forget_session(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Simulate a transport fault: the connection dies without touching any
    /// server state and its failure listeners are told.
    pub fn fail(&self, cause: &Error) {
        if self.context.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.started.store(false, Ordering::Release);
        self.core.registry.remove_connection(self.id());
        warn!(connection = %self.id(), %cause, "Connection failed");
        let listeners = self.failure_listeners.lock().clone();
        for listener in listeners {
            listener.connection_failed(self.id(), cause);
        }
    }

    fn find_consumer_for_ack(&self, ack: &AckInfo) -> Result<Arc<ServerConsumer>> {
        self.sessions
            .iter()
            .find_map(|session| session.consumer(ack.consumer_id))
            .ok_or_else(|| {
                Error::illegal_state(format!("no consumer {} on connection {}", ack.consumer_id, self.id()))
            })
    }

    fn apply_payload(&self, tx: &Transaction, payload: TransactionPayload) -> Result<()> {
        for message in payload.sends {
            self.core.destinations.route(self.context.stamp(message), Some(tx))?;
        }
        for ack in payload.acks {
            self.find_consumer_for_ack(&ack)?.acknowledge(ack.message_id, Some(tx))?;
        }
        Ok(())
    }

    fn one_phase_commit(&self, payload: TransactionPayload) -> Result<()> {
        let tx = self.core.transactions.create_transaction();
        if let Err(err) = self.apply_payload(&tx, payload) {
            if let Err(undo) = tx.rollback() {
                error!(connection = %self.id(), %undo, "Failed to roll back transaction");
            }
            return Err(err);
        }
        tx.commit()
    }

    fn prepare(&self, xid: Xid, payload: TransactionPayload) -> Result<()> {
        let transactions = &self.core.transactions;
        let tx = transactions.create_xa_transaction(xid.clone())?;
        let outcome = self.apply_payload(&tx, payload).and_then(|()| transactions.prepare(&xid));
        if let Err(err) = outcome {
            if let Err(undo) = transactions.rollback(&xid) {
                error!(connection = %self.id(), %xid, %undo, "Failed to roll back branch");
            }
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn close_connection(&self) -> Result<()> {
        if self.context.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.context.started.store(false, Ordering::Release);
        let mut first_error = None;
        for session in self.sessions() {
            if let Err(err) = session.close_session() {
                first_error.get_or_insert(err);
            }
        }
        self.core.registry.remove_connection(self.id());
        debug!(connection = %self.id(), "Closed connection");
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ConnectionDelegate for ServerConnection {
    fn server_id(&self) -> ServerId {
        self.core.server_id
    }

    fn connection_id(&self) -> ConnectionId {
        self.id()
    }

    async fn set_client_id(&self, client_id: &str) -> Result<()> {
        self.context.ensure_open()?;
        if !self.sessions.is_empty() {
            return Err(Error::illegal_state("client id must be set before creating sessions"));
        }
        let mut current = self.context.client_id.write();
        if let Some(existing) = current.as_deref() {
            return Err(Error::illegal_state(format!("client id already set to {existing}")));
        }
        *current = Some(client_id.to_string());
        debug!(connection = %self.id(), client_id, "Set client id");
        Ok(())
    }

    async fn create_session_delegate(
        &self,
        transacted: bool,
        ack_mode: AckMode,
        xa: bool,
    ) -> Result<Arc<dyn SessionDelegate>> {
        self.context.ensure_open()?;
        let id = SessionId::new(self.core.registry.next_id());
        let session = ServerSession::new(
            id,
            transacted,
            ack_mode,
            xa,
            Arc::clone(&self.core),
            Arc::clone(&self.context),
            self.me.clone(),
        );
        self.sessions.insert(id, Arc::clone(&session));
        self.core.registry.add_session(Arc::clone(&session));
        debug!(connection = %self.id(), session = %id, transacted, ?ack_mode, xa, "Created session");
        Ok(session)
    }

    async fn start(&self) -> Result<()> {
        self.context.ensure_open()?;
        self.context.started.store(true, Ordering::Release);
        for session in self.sessions() {
            for consumer in session.consumers() {
                consumer.prompt();
            }
        }
        debug!(connection = %self.id(), "Started connection");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.context.ensure_open()?;
        self.context.started.store(false, Ordering::Release);
        debug!(connection = %self.id(), "Stopped connection");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_connection()
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<()> {
        self.context.ensure_open()?;
        match request {
            TransactionRequest::OnePhaseCommit { payload } => self.one_phase_commit(payload),
            TransactionRequest::Prepare { xid, payload } => self.prepare(xid, payload),
            TransactionRequest::Commit { xid } => {
                self.core.transactions.commit(&xid)?;
                info!(connection = %self.id(), %xid, "Committed branch");
                Ok(())
            },
            TransactionRequest::Rollback { xid } => {
                self.core.transactions.rollback(&xid)?;
                info!(connection = %self.id(), %xid, "Rolled back branch");
                Ok(())
            },
        }
    }

    async fn prepared_transactions(&self) -> Result<Vec<Xid>> {
        self.context.ensure_open()?;
        Ok(self.core.transactions.in_doubt_xids())
    }

    fn set_delivery_listener(&self, listener: Arc<dyn DeliveryListener>) {
        *self.context.listener.write() = Some(listener);
    }

    fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.failure_listeners.lock().push(listener);
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id())
            .field("server_id", &self.core.server_id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
