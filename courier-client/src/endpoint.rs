//! Consumers, producers and browsers of a client session.
//!
//! Each handle keeps its mirror state next to the server delegate so the
//! failover coordinator can recreate the endpoint elsewhere and swap the
//! delegate in place.

use crate::{
    callback::{CallbackManager, MessageCallbackHandler},
    interceptor::SessionInterceptor,
    state::{BrowserState, ConsumerState, ProducerState},
};
use courier_core::{
    delegate::{BrowserDelegate, ClientDelivery, ConsumerDelegate, ConsumerSpec, ProducerDelegate},
    types::{BrowserId, ConsumerId, ProducerId},
    Destination, Error, Message, Result,
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

struct ConsumerInner {
    delegate: RwLock<Arc<dyn ConsumerDelegate>>,
    state: RwLock<ConsumerState>,
    handler: Arc<MessageCallbackHandler>,
    session: Arc<SessionInterceptor>,
    callbacks: Arc<CallbackManager>,
    receive_timeout: Duration,
    closed: AtomicBool,
}

/// A message consumer.
#[derive(Clone)]
pub struct ClientConsumer {
    inner: Arc<ConsumerInner>,
}

impl ClientConsumer {
    pub(crate) fn new(
        delegate: Arc<dyn ConsumerDelegate>,
        spec: ConsumerSpec,
        handler: Arc<MessageCallbackHandler>,
        session: Arc<SessionInterceptor>,
        callbacks: Arc<CallbackManager>,
        receive_timeout: Duration,
    ) -> Self {
        let state = ConsumerState::new(delegate.consumer_id(), spec);
        Self {
            inner: Arc::new(ConsumerInner {
                delegate: RwLock::new(delegate),
                state: RwLock::new(state),
                handler,
                session,
                callbacks,
                receive_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Server-assigned consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.inner.state.read().consumer_id
    }

    /// How the consumer was created.
    #[must_use]
    pub fn spec(&self) -> ConsumerSpec {
        self.inner.state.read().spec.clone()
    }

    /// Snapshot of the consumer state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.inner.state.read().clone()
    }

    /// Buffer the connection feeds this consumer's deliveries into.
    #[must_use]
    pub fn handler(&self) -> &Arc<MessageCallbackHandler> {
        &self.inner.handler
    }

    /// Whether the consumer was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("consumer {} is closed", self.id())));
        }
        Ok(())
    }

    /// Wait for the next message, at most `timeout` or the configured default.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] on a closed consumer, or the server's
    /// error when an immediate acknowledgement fails.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.inner.receive_timeout);
        match self.inner.handler.receive(Some(timeout)).await {
            Some(delivery) => self.deliver(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Take a message that is already buffered.
    ///
    /// # Errors
    /// Same as [`ClientConsumer::receive`].
    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.ensure_open()?;
        match self.inner.handler.try_receive() {
            Some(delivery) => self.deliver(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    async fn deliver(&self, delivery: ClientDelivery) -> Result<Message> {
        let message = delivery.message.clone();
        self.inner.session.post_deliver(delivery).await?;
        Ok(message)
    }

    /// Close the consumer. Its unacknowledged messages go back to the server.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.close_local();
        let delegate = Arc::clone(&self.inner.delegate.read());
        debug!(consumer = %self.id(), "Closing consumer");
        delegate.close().await
    }

    pub(crate) fn close_local(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id();
        self.inner.handler.close();
        self.inner.callbacks.unregister_handler(id);
        self.inner.session.drop_consumer(id);
    }

    /// Swap in the consumer recreated on another server. Returns the old id.
    pub fn replace_delegate(&self, new: Arc<dyn ConsumerDelegate>) -> ConsumerId {
        let mut state = self.inner.state.write();
        let old = state.consumer_id;
        let fresh = ConsumerState::new(new.consumer_id(), state.spec.clone());
        state.copy_state_from(&fresh);
        *self.inner.delegate.write() = new;
        old
    }
}

impl fmt::Debug for ClientConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConsumer")
            .field("state", &*self.inner.state.read())
            .field("buffered", &self.inner.handler.buffered())
            .finish()
    }
}

struct ProducerInner {
    delegate: RwLock<Arc<dyn ProducerDelegate>>,
    state: RwLock<ProducerState>,
    session: Arc<SessionInterceptor>,
    closed: AtomicBool,
}

/// A message producer bound to one destination.
#[derive(Clone)]
pub struct ClientProducer {
    inner: Arc<ProducerInner>,
}

impl ClientProducer {
    pub(crate) fn new(delegate: Arc<dyn ProducerDelegate>, destination: Destination, session: Arc<SessionInterceptor>) -> Self {
        let state = ProducerState::new(delegate.producer_id(), destination);
        Self {
            inner: Arc::new(ProducerInner {
                delegate: RwLock::new(delegate),
                state: RwLock::new(state),
                session,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Server-assigned producer id.
    #[must_use]
    pub fn id(&self) -> ProducerId {
        self.inner.state.read().producer_id
    }

    /// Destination of every sent message.
    #[must_use]
    pub fn destination(&self) -> Destination {
        self.inner.state.read().destination.clone()
    }

    /// Snapshot of the producer state.
    #[must_use]
    pub fn state(&self) -> ProducerState {
        self.inner.state.read().clone()
    }

    /// Whether the producer was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send `message` to the producer's destination. Inside a transaction the
    /// send is staged until commit.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] on a closed producer, or the server's error.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("producer {} is closed", self.id())));
        }
        message.destination = self.destination();
        let delegate = Arc::clone(&self.inner.delegate.read());
        self.inner.session.send(delegate.as_ref(), message).await
    }

    /// Close the producer.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let delegate = Arc::clone(&self.inner.delegate.read());
        delegate.close().await
    }

    pub(crate) fn close_local(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Swap in the producer recreated on another server. Returns the old id.
    pub fn replace_delegate(&self, new: Arc<dyn ProducerDelegate>) -> ProducerId {
        let mut state = self.inner.state.write();
        let old = state.producer_id;
        let fresh = ProducerState::new(new.producer_id(), state.destination.clone());
        state.copy_state_from(&fresh);
        *self.inner.delegate.write() = new;
        old
    }
}

impl fmt::Debug for ClientProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientProducer").field(&*self.inner.state.read()).finish()
    }
}

struct BrowserInner {
    delegate: RwLock<Arc<dyn BrowserDelegate>>,
    state: RwLock<BrowserState>,
    closed: AtomicBool,
}

/// A queue browser.
#[derive(Clone)]
pub struct ClientBrowser {
    inner: Arc<BrowserInner>,
}

impl ClientBrowser {
    pub(crate) fn new(delegate: Arc<dyn BrowserDelegate>, destination: Destination, selector: Option<String>) -> Self {
        let state = BrowserState::new(delegate.browser_id(), destination, selector);
        Self {
            inner: Arc::new(BrowserInner {
                delegate: RwLock::new(delegate),
                state: RwLock::new(state),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Server-assigned browser id.
    #[must_use]
    pub fn id(&self) -> BrowserId {
        self.inner.state.read().browser_id
    }

    /// Snapshot of the browser state.
    #[must_use]
    pub fn state(&self) -> BrowserState {
        self.inner.state.read().clone()
    }

    /// Whether the browser was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn delegate(&self) -> Result<Arc<dyn BrowserDelegate>> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("browser {} is closed", self.id())));
        }
        Ok(Arc::clone(&self.inner.delegate.read()))
    }

    /// Whether more messages are available.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] on a closed browser.
    pub async fn has_next(&self) -> Result<bool> {
        self.delegate()?.has_next().await
    }

    /// Up to `max` further messages.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] on a closed browser.
    pub async fn next_messages(&self, max: usize) -> Result<Vec<Message>> {
        self.delegate()?.next_messages(max).await
    }

    /// Start over from a fresh snapshot.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] on a closed browser.
    pub async fn reset(&self) -> Result<()> {
        self.delegate()?.reset().await
    }

    /// Close the browser.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let delegate = Arc::clone(&self.inner.delegate.read());
        delegate.close().await
    }

    pub(crate) fn close_local(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Swap in the browser recreated on another server. Returns the old id.
    pub fn replace_delegate(&self, new: Arc<dyn BrowserDelegate>) -> BrowserId {
        let mut state = self.inner.state.write();
        let old = state.browser_id;
        let fresh = BrowserState::new(new.browser_id(), state.destination.clone(), state.selector.clone());
        state.copy_state_from(&fresh);
        *self.inner.delegate.write() = new;
        old
    }
}

impl fmt::Debug for ClientBrowser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientBrowser").field(&*self.inner.state.read()).finish()
    }
}
