//! Acknowledgement-mode handling around a session delegate.
//!
//! The interceptor sits between the application-facing session and the
//! server session. After every successful receive it decides, from the
//! session's mode, whether the delivery is acknowledged right away, buffered
//! until the application acknowledges the session, or staged in the current
//! transaction. It also owns the session's unacknowledged deliveries, which
//! drive recovery, rollback redelivery and failover replay.

use crate::{
    callback::CallbackManager,
    state::SessionState,
    tx::{ResourceManager, TxKey},
};
use async_trait::async_trait;
use courier_core::{
    delegate::{
        AckInfo, BrowserDelegate, ClientDelivery, ConnectionDelegate, ConsumerDelegate, ConsumerSpec,
        ProducerDelegate, SessionDelegate,
    },
    types::{ConsumerId, SessionId},
    AckMode, Destination, Error, Message, Result, Xid,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Session delegate decorator applying the session's acknowledgement mode.
pub struct SessionInterceptor {
    inner: RwLock<Arc<dyn SessionDelegate>>,
    state: Mutex<SessionState>,
    resource_manager: Arc<ResourceManager>,
    callbacks: Arc<CallbackManager>,
    local_tx: Mutex<Option<TxKey>>,
    xa_branch: Mutex<Option<Xid>>,
    closed: AtomicBool,
}

impl SessionInterceptor {
    /// Wrap `inner`. A transacted session opens its first local transaction here.
    #[must_use]
    pub fn new(
        inner: Arc<dyn SessionDelegate>,
        transacted: bool,
        ack_mode: AckMode,
        xa: bool,
        resource_manager: Arc<ResourceManager>,
        callbacks: Arc<CallbackManager>,
    ) -> Self {
        let state = SessionState::new(inner.session_id(), transacted, ack_mode, xa);
        let local_tx = transacted.then(|| resource_manager.create_local_tx());
        Self {
            inner: RwLock::new(inner),
            state: Mutex::new(state),
            resource_manager,
            callbacks,
            local_tx: Mutex::new(local_tx),
            xa_branch: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Current server session.
    #[must_use]
    pub fn delegate(&self) -> Arc<dyn SessionDelegate> {
        Arc::clone(&self.inner.read())
    }

    /// Snapshot of the session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Whether the session is transacted.
    #[must_use]
    pub fn is_transacted(&self) -> bool {
        self.state.lock().transacted
    }

    /// Whether the session takes part in XA transactions.
    #[must_use]
    pub fn is_xa(&self) -> bool {
        self.state.lock().xa
    }

    /// Acknowledgement mode.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.state.lock().ack_mode
    }

    /// Number of received but unacknowledged deliveries.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Resource manager of the owning connection.
    #[must_use]
    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    /// Whether the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("session {} is closed", self.session_id())));
        }
        Ok(())
    }

    /// Transaction that sends and acknowledgements go to, if any.
    ///
    /// An XA session outside a branch behaves like a non-transacted session.
    #[must_use]
    pub fn current_tx(&self) -> Option<TxKey> {
        if let Some(xid) = self.xa_branch.lock().clone() {
            return Some(TxKey::Xa(xid));
        }
        self.local_tx.lock().clone()
    }

    /// Send `message` through `producer`, or stage it in the current transaction.
    ///
    /// # Errors
    /// Returns the producer's or the resource manager's error.
    pub async fn send(&self, producer: &dyn ProducerDelegate, message: Message) -> Result<()> {
        self.ensure_open()?;
        match self.current_tx() {
            Some(tx) => self.resource_manager.add_message(&tx, message),
            None => producer.send(message).await,
        }
    }

    /// Apply the acknowledgement mode to a delivery the application just received.
    ///
    /// # Errors
    /// Returns the server's error for an immediate acknowledgement.
    pub async fn post_deliver(&self, delivery: ClientDelivery) -> Result<()> {
        if let Some(tx) = self.current_tx() {
            self.resource_manager.add_ack(&tx, delivery.ack_info())?;
            self.state.lock().unacked.push(delivery);
            return Ok(());
        }
        match self.ack_mode() {
            AckMode::AutoAcknowledge | AckMode::DupsOkAcknowledge => self.delegate().acknowledge(delivery.ack_info()).await,
            AckMode::ClientAcknowledge => {
                self.state.lock().unacked.push(delivery);
                Ok(())
            },
        }
    }

    /// Acknowledge every buffered delivery of a client-acknowledge session.
    ///
    /// The buffer is emptied even when the server rejects the batch. A no-op
    /// in any other mode.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn acknowledge_session(&self) -> Result<()> {
        self.ensure_open()?;
        if self.current_tx().is_some() || self.ack_mode() != AckMode::ClientAcknowledge {
            return Ok(());
        }
        let acks: Vec<AckInfo> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.unacked).iter().map(ClientDelivery::ack_info).collect()
        };
        if acks.is_empty() {
            return Ok(());
        }
        self.delegate().acknowledge_batch(acks).await
    }

    /// Redeliver every unacknowledged delivery, oldest first.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a session inside a transaction.
    pub fn recover(&self) -> Result<()> {
        self.ensure_open()?;
        if self.current_tx().is_some() {
            return Err(Error::illegal_state("cannot recover a transacted session"));
        }
        self.redeliver_all();
        Ok(())
    }

    fn redeliver_all(&self) {
        let unacked = std::mem::take(&mut self.state.lock().unacked);
        if !unacked.is_empty() {
            debug!(session = %self.session_id(), count = unacked.len(), "Redelivering unacknowledged messages");
            self.callbacks.redeliver(unacked);
        }
    }

    fn local_tx(&self) -> Result<TxKey> {
        if self.xa_branch.lock().is_some() {
            return Err(Error::illegal_state("session is associated with an XA branch"));
        }
        self.local_tx.lock().clone().ok_or_else(|| Error::illegal_state("session is not transacted"))
    }

    fn renew_local_tx(&self) {
        *self.local_tx.lock() = Some(self.resource_manager.create_local_tx());
    }

    /// Commit the local transaction and open the next one.
    ///
    /// When the commit fails nothing was applied; the received messages are
    /// redelivered as after a rollback and the error is returned.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted session, or the
    /// server's error.
    pub async fn commit(&self, connection: &dyn ConnectionDelegate) -> Result<()> {
        self.ensure_open()?;
        let tx = self.local_tx()?;
        let outcome = self.resource_manager.commit_local(&tx, connection).await;
        self.renew_local_tx();
        match outcome {
            Ok(acks) => {
                self.forget(&acks);
                Ok(())
            },
            Err(err) => {
                warn!(session = %self.session_id(), %err, "Commit failed, rolling back");
                self.redeliver_all();
                Err(err)
            },
        }
    }

    /// Discard the local transaction, redeliver what it received and open the next one.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted session.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let tx = self.local_tx()?;
        let outcome = self.resource_manager.rollback_local(&tx);
        self.renew_local_tx();
        outcome?;
        self.redeliver_all();
        Ok(())
    }

    /// Associate the session with a new XA branch.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the session is not XA, already
    /// associated, or the branch exists.
    pub fn start_branch(&self, xid: &Xid) -> Result<()> {
        self.ensure_open()?;
        if !self.is_xa() {
            return Err(Error::illegal_state("session is not an XA session"));
        }
        let mut branch = self.xa_branch.lock();
        if let Some(current) = branch.as_ref() {
            return Err(Error::illegal_state(format!("session already associated with {current}")));
        }
        self.resource_manager.start(xid)?;
        *branch = Some(xid.clone());
        Ok(())
    }

    /// End the association with `xid`.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the session is not associated with `xid`.
    pub fn end_branch(&self, xid: &Xid, failed: bool) -> Result<()> {
        let mut branch = self.xa_branch.lock();
        if branch.as_ref() != Some(xid) {
            return Err(Error::illegal_state(format!("session is not associated with {xid}")));
        }
        self.resource_manager.end(xid, failed)?;
        *branch = None;
        Ok(())
    }

    /// Settle the deliveries behind `acks` once their transaction completed.
    /// Rolled back deliveries are handed back to their consumers.
    pub fn complete(&self, acks: &[AckInfo], redeliver: bool) {
        if redeliver {
            let settled = self.take_matching(acks);
            self.callbacks.redeliver(settled);
        } else {
            self.forget(acks);
        }
    }

    fn forget(&self, acks: &[AckInfo]) {
        self.take_matching(acks);
    }

    fn take_matching(&self, acks: &[AckInfo]) -> Vec<ClientDelivery> {
        let keys: HashSet<_> = acks.iter().map(|a| (a.message_id, a.consumer_id)).collect();
        let mut state = self.state.lock();
        let (matching, rest) = std::mem::take(&mut state.unacked)
            .into_iter()
            .partition(|d| keys.contains(&(d.message.id, d.consumer_id)));
        state.unacked = rest;
        matching
    }

    /// Forget everything received by a consumer that is going away.
    pub fn drop_consumer(&self, consumer_id: ConsumerId) {
        self.state.lock().unacked.retain(|d| d.consumer_id != consumer_id);
        self.resource_manager.remove_acks_for_consumer(consumer_id);
    }

    /// Swap the server session after failover and adopt its identity.
    pub fn replace_delegate(&self, new: Arc<dyn SessionDelegate>) {
        let new_state = SessionState::new(new.session_id(), false, AckMode::default(), false);
        self.state.lock().copy_state_from(&new_state);
        *self.inner.write() = new;
    }

    /// Point unacknowledged deliveries of consumer `old` at consumer `new`.
    pub fn remap_consumer(&self, old: ConsumerId, new: ConsumerId) {
        self.state.lock().remap_consumer(old, new);
    }

    /// Acknowledgements the new server must restore after failover.
    ///
    /// Non-persistent deliveries did not survive the failed server and are
    /// forgotten here, including the acknowledgements open transactions
    /// staged for them. Expects consumers already remapped to `consumers`.
    pub fn failover_ack_infos(&self, consumers: &HashSet<ConsumerId>) -> Vec<AckInfo> {
        let mut state = self.state.lock();
        let dropped = state.remove_non_persistent();
        if state.transacted || state.xa {
            let staged = self.resource_manager.remove_non_persistent_acks(consumers);
            debug!(session = %state.session_id, staged, "Dropped staged non-persistent acknowledgements");
        }
        if dropped > 0 {
            debug!(session = %state.session_id, dropped, "Dropped non-persistent deliveries");
        }
        state.ack_infos()
    }

    /// Mark the session closed and forget its deliveries without telling the server.
    pub fn close_local(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.lock().unacked.clear();
        if let Some(tx) = self.local_tx.lock().take() {
            if let Err(err) = self.resource_manager.rollback_local(&tx) {
                debug!(session = %self.session_id(), %err, "Local transaction already gone");
            }
        }
    }
}

#[async_trait]
impl SessionDelegate for SessionInterceptor {
    fn session_id(&self) -> SessionId {
        self.state.lock().session_id
    }

    async fn create_consumer_delegate(&self, spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDelegate>> {
        self.ensure_open()?;
        self.delegate().create_consumer_delegate(spec).await
    }

    async fn create_producer_delegate(&self, destination: Destination) -> Result<Arc<dyn ProducerDelegate>> {
        self.ensure_open()?;
        self.delegate().create_producer_delegate(destination).await
    }

    async fn create_browser_delegate(
        &self,
        destination: Destination,
        selector: Option<String>,
    ) -> Result<Arc<dyn BrowserDelegate>> {
        self.ensure_open()?;
        self.delegate().create_browser_delegate(destination, selector).await
    }

    async fn acknowledge(&self, ack: AckInfo) -> Result<()> {
        self.delegate().acknowledge(ack).await
    }

    async fn acknowledge_batch(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.delegate().acknowledge_batch(acks).await
    }

    async fn cancel_deliveries(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.delegate().cancel_deliveries(acks).await
    }

    async fn send_unacked_ack_infos(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.delegate().send_unacked_ack_infos(acks).await
    }

    async fn unsubscribe(&self, subscription_name: &str) -> Result<()> {
        self.ensure_open()?;
        self.delegate().unsubscribe(subscription_name).await
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.close_local();
        self.delegate().close().await
    }
}

impl fmt::Debug for SessionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionInterceptor")
            .field("session_id", &state.session_id)
            .field("transacted", &state.transacted)
            .field("ack_mode", &state.ack_mode)
            .field("unacked", &state.unacked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::MessageCallbackHandler;
    use bytes::Bytes;

    /// Server session stand-in recording acknowledgements.
    #[derive(Default)]
    struct Recording {
        acked: Mutex<Vec<AckInfo>>,
        batches: Mutex<usize>,
    }

    #[async_trait]
    impl SessionDelegate for Recording {
        fn session_id(&self) -> SessionId {
            SessionId::new(1)
        }

        async fn create_consumer_delegate(&self, _spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDelegate>> {
            Err(Error::illegal_state("not supported"))
        }

        async fn create_producer_delegate(&self, _destination: Destination) -> Result<Arc<dyn ProducerDelegate>> {
            Err(Error::illegal_state("not supported"))
        }

        async fn create_browser_delegate(
            &self,
            _destination: Destination,
            _selector: Option<String>,
        ) -> Result<Arc<dyn BrowserDelegate>> {
            Err(Error::illegal_state("not supported"))
        }

        async fn acknowledge(&self, ack: AckInfo) -> Result<()> {
            self.acked.lock().push(ack);
            Ok(())
        }

        async fn acknowledge_batch(&self, acks: Vec<AckInfo>) -> Result<()> {
            *self.batches.lock() += 1;
            self.acked.lock().extend(acks);
            Ok(())
        }

        async fn cancel_deliveries(&self, _acks: Vec<AckInfo>) -> Result<()> {
            Ok(())
        }

        async fn send_unacked_ack_infos(&self, _acks: Vec<AckInfo>) -> Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _subscription_name: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        server: Arc<Recording>,
        callbacks: Arc<CallbackManager>,
        handler: Arc<MessageCallbackHandler>,
        session: SessionInterceptor,
    }

    fn fixture(transacted: bool, ack_mode: AckMode) -> Fixture {
        let server = Arc::new(Recording::default());
        let callbacks = Arc::new(CallbackManager::new());
        let handler = Arc::new(MessageCallbackHandler::new(ConsumerId::new(7)));
        callbacks.register_handler(Arc::clone(&handler));
        let session = SessionInterceptor::new(
            server.clone(),
            transacted,
            ack_mode,
            false,
            Arc::new(ResourceManager::new()),
            Arc::clone(&callbacks),
        );
        Fixture { server, callbacks, handler, session }
    }

    fn delivery(body: &'static str) -> ClientDelivery {
        let message = Message::builder(Destination::queue("q").unwrap())
            .payload(Bytes::from_static(body.as_bytes()))
            .persistent(true)
            .build()
            .unwrap();
        ClientDelivery { message, consumer_id: ConsumerId::new(7), delivery_count: 1 }
    }

    fn bodies(handler: &MessageCallbackHandler) -> Vec<String> {
        std::iter::from_fn(|| handler.try_receive())
            .map(|d| String::from_utf8(d.message.payload.to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_auto_and_dups_ok_acknowledge_each_receive() {
        for mode in [AckMode::AutoAcknowledge, AckMode::DupsOkAcknowledge] {
            let f = fixture(false, mode);
            f.session.post_deliver(delivery("a")).await.unwrap();
            f.session.post_deliver(delivery("b")).await.unwrap();
            assert_eq!(f.server.acked.lock().len(), 2);
            assert_eq!(f.session.unacked_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_client_acknowledge_buffers_until_session_ack() {
        let f = fixture(false, AckMode::ClientAcknowledge);
        f.session.post_deliver(delivery("a")).await.unwrap();
        f.session.post_deliver(delivery("b")).await.unwrap();
        assert!(f.server.acked.lock().is_empty());

        f.session.acknowledge_session().await.unwrap();
        assert_eq!(f.server.acked.lock().len(), 2);
        assert_eq!(*f.server.batches.lock(), 1);
        assert_eq!(f.session.unacked_count(), 0);

        f.session.acknowledge_session().await.unwrap();
        assert_eq!(*f.server.batches.lock(), 1);
    }

    #[tokio::test]
    async fn test_recover_redelivers_in_receipt_order() {
        let f = fixture(false, AckMode::ClientAcknowledge);
        for body in ["a", "b", "c"] {
            f.session.post_deliver(delivery(body)).await.unwrap();
        }
        f.handler.handle_message(delivery("d"));

        f.session.recover().unwrap();
        assert_eq!(bodies(&f.handler), vec!["a", "b", "c", "d"]);
        assert!(f.server.acked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transacted_session_stages_acks() {
        let f = fixture(true, AckMode::AutoAcknowledge);
        f.session.post_deliver(delivery("a")).await.unwrap();
        assert!(f.server.acked.lock().is_empty());
        let tx = f.session.current_tx().unwrap();
        assert_eq!(f.session.resource_manager().acks(&tx).len(), 1);
        assert!(f.session.recover().unwrap_err().is_illegal_state());

        f.session.rollback().unwrap();
        assert_ne!(f.session.current_tx(), Some(tx.clone()));
        assert!(!f.session.resource_manager().contains(&tx));
        let redelivered = f.handler.try_receive().unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        assert_eq!(f.callbacks.len(), 1);
    }

    #[tokio::test]
    async fn test_non_transacted_commit_is_rejected() {
        let f = fixture(false, AckMode::AutoAcknowledge);
        assert!(f.session.rollback().unwrap_err().is_illegal_state());
        assert!(f.session.start_branch(&Xid::generate()).unwrap_err().is_illegal_state());
    }

    #[tokio::test]
    async fn test_failover_keeps_only_persistent_deliveries() {
        let f = fixture(false, AckMode::ClientAcknowledge);
        f.session.post_deliver(delivery("p")).await.unwrap();
        let transient = ClientDelivery {
            message: Message::new(Destination::queue("q").unwrap(), Bytes::from_static(b"np")),
            consumer_id: ConsumerId::new(7),
            delivery_count: 1,
        };
        f.session.post_deliver(transient).await.unwrap();

        f.session.remap_consumer(ConsumerId::new(7), ConsumerId::new(70));
        let consumers: HashSet<_> = [ConsumerId::new(70)].into_iter().collect();
        let acks = f.session.failover_ack_infos(&consumers);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].consumer_id, ConsumerId::new(70));
        assert_eq!(f.session.unacked_count(), 1);
    }
}
