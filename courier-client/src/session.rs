//! Application-facing session.

use crate::{
    callback::MessageCallbackHandler,
    connection::ConnectionShared,
    endpoint::{ClientBrowser, ClientConsumer, ClientProducer},
    interceptor::SessionInterceptor,
    state::SessionState,
    xa::XaResource,
};
use courier_core::{
    delegate::{ConsumerSpec, SessionDelegate},
    types::SessionId,
    AckMode, Destination, Error, Result,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::debug;

struct SessionInner {
    interceptor: Arc<SessionInterceptor>,
    connection: Arc<ConnectionShared>,
    consumers: Mutex<Vec<ClientConsumer>>,
    producers: Mutex<Vec<ClientProducer>>,
    browsers: Mutex<Vec<ClientBrowser>>,
}

/// A client session. Cheap to clone.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    pub(crate) fn new(
        delegate: Arc<dyn SessionDelegate>,
        transacted: bool,
        ack_mode: AckMode,
        xa: bool,
        connection: Arc<ConnectionShared>,
    ) -> Self {
        let interceptor = Arc::new(SessionInterceptor::new(
            delegate,
            transacted,
            ack_mode,
            xa,
            Arc::clone(&connection.resource_manager),
            Arc::clone(&connection.callbacks),
        ));
        Self {
            inner: Arc::new(SessionInner {
                interceptor,
                connection,
                consumers: Mutex::new(Vec::new()),
                producers: Mutex::new(Vec::new()),
                browsers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Server-assigned session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.interceptor.session_id()
    }

    /// Whether the session is transacted.
    #[must_use]
    pub fn is_transacted(&self) -> bool {
        self.inner.interceptor.is_transacted()
    }

    /// Whether the session takes part in XA transactions.
    #[must_use]
    pub fn is_xa(&self) -> bool {
        self.inner.interceptor.is_xa()
    }

    /// Acknowledgement mode.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.inner.interceptor.ack_mode()
    }

    /// Whether the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.interceptor.is_closed()
    }

    /// Snapshot of the session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.interceptor.state()
    }

    /// The acknowledgement-mode interceptor wrapping the server session.
    #[must_use]
    pub fn interceptor(&self) -> &Arc<SessionInterceptor> {
        &self.inner.interceptor
    }

    /// Open consumers.
    #[must_use]
    pub fn consumers(&self) -> Vec<ClientConsumer> {
        let mut consumers = self.inner.consumers.lock();
        consumers.retain(|c| !c.is_closed());
        consumers.clone()
    }

    /// Open producers.
    #[must_use]
    pub fn producers(&self) -> Vec<ClientProducer> {
        let mut producers = self.inner.producers.lock();
        producers.retain(|p| !p.is_closed());
        producers.clone()
    }

    /// Open browsers.
    #[must_use]
    pub fn browsers(&self) -> Vec<ClientBrowser> {
        let mut browsers = self.inner.browsers.lock();
        browsers.retain(|b| !b.is_closed());
        browsers.clone()
    }

    /// Create a producer for `destination`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDestination`] for an unknown destination.
    pub async fn create_producer(&self, destination: Destination) -> Result<ClientProducer> {
        let delegate = self.inner.interceptor.create_producer_delegate(destination.clone()).await?;
        let producer = ClientProducer::new(delegate, destination, Arc::clone(&self.inner.interceptor));
        self.inner.producers.lock().push(producer.clone());
        Ok(producer)
    }

    /// Create a consumer on `destination`, optionally filtered by `selector`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDestination`] for an unknown destination or an
    /// invalid selector.
    pub async fn create_consumer(&self, destination: Destination, selector: Option<&str>) -> Result<ClientConsumer> {
        let mut spec = ConsumerSpec::new(destination);
        spec.selector = selector.map(str::to_string);
        self.create_consumer_with(spec).await
    }

    /// Create a consumer from a full [`ConsumerSpec`].
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn create_consumer_with(&self, spec: ConsumerSpec) -> Result<ClientConsumer> {
        let delegate = self.inner.interceptor.create_consumer_delegate(spec.clone()).await?;
        let handler = Arc::new(MessageCallbackHandler::new(delegate.consumer_id()));
        self.inner.connection.callbacks.register_handler(Arc::clone(&handler));
        let consumer = ClientConsumer::new(
            delegate,
            spec,
            handler,
            Arc::clone(&self.inner.interceptor),
            Arc::clone(&self.inner.connection.callbacks),
            self.inner.connection.config.default_receive_timeout(),
        );
        self.inner.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    /// Create or reattach to the durable subscription `name` on `topic`.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] without a client id or when the
    /// subscription already has an active consumer.
    pub async fn create_durable_subscriber(
        &self,
        topic: Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<ClientConsumer> {
        if !topic.is_topic() {
            return Err(Error::invalid_destination(format!("durable subscriptions need a topic, not {topic}")));
        }
        let mut spec = ConsumerSpec::new(topic).with_subscription_name(name).with_no_local(no_local);
        spec.selector = selector.map(str::to_string);
        self.create_consumer_with(spec).await
    }

    /// Create a browser over `queue`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDestination`] for anything but an existing queue.
    pub async fn create_browser(&self, queue: Destination, selector: Option<&str>) -> Result<ClientBrowser> {
        let selector = selector.map(str::to_string);
        let delegate = self.inner.interceptor.create_browser_delegate(queue.clone(), selector.clone()).await?;
        let browser = ClientBrowser::new(delegate, queue, selector);
        self.inner.browsers.lock().push(browser.clone());
        Ok(browser)
    }

    /// Acknowledge everything received so far in a client-acknowledge session.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn acknowledge(&self) -> Result<()> {
        self.inner.interceptor.acknowledge_session().await
    }

    /// Redeliver every unacknowledged message.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a transacted session.
    pub fn recover(&self) -> Result<()> {
        self.inner.interceptor.recover()
    }

    /// Commit the session's transaction.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted session, or the
    /// server's error after rolling back.
    pub async fn commit(&self) -> Result<()> {
        let connection = self.inner.connection.delegate();
        self.inner.interceptor.commit(connection.as_ref()).await
    }

    /// Roll back the session's transaction.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-transacted session.
    pub fn rollback(&self) -> Result<()> {
        self.inner.interceptor.rollback()
    }

    /// Delete the durable subscription `name`.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] while it has an active consumer, or
    /// [`Error::InvalidDestination`] if it does not exist.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.inner.interceptor.unsubscribe(name).await
    }

    /// XA resource bound to this session.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] for a non-XA session.
    pub fn xa_resource(&self) -> Result<XaResource> {
        if !self.is_xa() {
            return Err(Error::illegal_state("session is not an XA session"));
        }
        Ok(XaResource::new(Arc::clone(&self.inner.interceptor), Arc::clone(&self.inner.connection)))
    }

    /// Close the session and everything it owns.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.close_endpoints();
        debug!(session = %self.id(), "Closing session");
        self.inner.interceptor.close().await
    }

    fn close_endpoints(&self) {
        for consumer in std::mem::take(&mut *self.inner.consumers.lock()) {
            consumer.close_local();
        }
        for producer in std::mem::take(&mut *self.inner.producers.lock()) {
            producer.close_local();
        }
        for browser in std::mem::take(&mut *self.inner.browsers.lock()) {
            browser.close_local();
        }
    }

    pub(crate) fn close_local(&self) {
        self.close_endpoints();
        self.inner.interceptor.close_local();
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientSession").field(&self.inner.interceptor).finish()
    }
}
