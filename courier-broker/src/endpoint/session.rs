use super::{
    ConnectionContext, ServerBrowser, ServerConnection, ServerConsumer, ServerCore, ServerProducer,
};
use crate::{channel::Channel, destination::Subscription, receiver::Receiver, selector::Selector};
use async_trait::async_trait;
use courier_core::{
    delegate::{
        AckInfo, BrowserDelegate, ConsumerDelegate, ConsumerSpec, ProducerDelegate, SessionDelegate,
    },
    types::{BrowserId, ConsumerId, ProducerId, SessionId},
    AckMode, Destination, Error, Result,
};
use dashmap::DashMap;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, warn};

/// Server side of a session.
pub struct ServerSession {
    id: SessionId,
    transacted: bool,
    ack_mode: AckMode,
    xa: bool,
    me: Weak<ServerSession>,
    core: Arc<ServerCore>,
    context: Arc<ConnectionContext>,
    connection: Weak<ServerConnection>,
    consumers: DashMap<ConsumerId, Arc<ServerConsumer>>,
    producers: DashMap<ProducerId, Arc<ServerProducer>>,
    browsers: DashMap<BrowserId, Arc<ServerBrowser>>,
    closed: AtomicBool,
}

impl ServerSession {
    pub(crate) fn new(
        id: SessionId,
        transacted: bool,
        ack_mode: AckMode,
        xa: bool,
        core: Arc<ServerCore>,
        context: Arc<ConnectionContext>,
        connection: Weak<ServerConnection>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            transacted,
            ack_mode,
            xa,
            me: me.clone(),
            core,
            context,
            connection,
            consumers: DashMap::new(),
            producers: DashMap::new(),
            browsers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session is transacted.
    #[must_use]
    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    /// Whether the session takes part in XA transactions.
    #[must_use]
    pub fn is_xa(&self) -> bool {
        self.xa
    }

    /// Acknowledgement mode the client declared.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Consumer of this session by id.
    #[must_use]
    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<ServerConsumer>> {
        self.consumers.get(&id).map(|c| Arc::clone(&c))
    }

    /// Every open consumer of this session.
    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<ServerConsumer>> {
        self.consumers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn ensure_open(&self) -> Result<()> {
        self.context.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::illegal_state(format!("session {} is closed", self.id)));
        }
        Ok(())
    }

    fn require_consumer(&self, id: ConsumerId) -> Result<Arc<ServerConsumer>> {
        self.consumer(id)
            .ok_or_else(|| Error::illegal_state(format!("no consumer {id} in session {}", self.id)))
    }

    pub(crate) fn forget_consumer(&self, id: ConsumerId) {
        self.consumers.remove(&id);
    }

    fn resolve_channel(
        &self,
        spec: &ConsumerSpec,
        selector: Option<Selector>,
    ) -> Result<(Channel, Option<Selector>, Option<Arc<Subscription>>)> {
        let destinations = &self.core.destinations;
        let no_local = spec.no_local.then(|| self.context.id());
        match (&spec.destination, &spec.subscription_name) {
            (Destination::Queue(name), _) => Ok((destinations.queue(name)?, selector, None)),
            (Destination::Topic(topic), Some(subscription)) => {
                let client_id = self.context.client_id().ok_or_else(|| {
                    Error::illegal_state("a durable subscription requires a client id")
                })?;
                let durable =
                    destinations.durable_subscription(&client_id, subscription, topic, selector, no_local)?;
                if durable.channel().receiver_count() > 0 {
                    return Err(Error::illegal_state(format!(
                        "durable subscription {subscription} already has an active consumer"
                    )));
                }
                Ok((durable.channel().clone(), None, None))
            },
            (Destination::Topic(topic), None) => {
                let subscription = destinations.create_subscription(topic, selector, no_local)?;
                Ok((subscription.channel().clone(), None, Some(subscription)))
            },
        }
    }

    pub(crate) fn close_session(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error = None;
        for consumer in self.consumers() {
            if let Err(err) = consumer.close_consumer() {
                warn!(session = %self.id, consumer = %consumer.id(), %err, "Failed to close consumer");
                first_error.get_or_insert(err);
            }
        }
        for producer in self.producers.iter() {
            producer.close_producer();
        }
        self.producers.clear();
        self.browsers.clear();
        self.core.registry.remove_session(self.id);
        if let Some(connection) = self.connection.upgrade() {
            connection.forget_session(self.id);
        }
        debug!(session = %self.id, "Closed session");
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl SessionDelegate for ServerSession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create_consumer_delegate(&self, spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDelegate>> {
        self.ensure_open()?;
        let selector = Selector::parse_optional(spec.selector.as_deref())?;
        let (channel, selector, subscription) = self.resolve_channel(&spec, selector)?;

        let id = ConsumerId::new(self.core.registry.next_id());
        let consumer = Arc::new(ServerConsumer::new(
            id,
            Arc::clone(&self.core),
            Arc::clone(&self.context),
            self.me.clone(),
            channel.clone(),
            selector,
            subscription,
        ));
        self.consumers.insert(id, Arc::clone(&consumer));
        self.core.registry.add_consumer(Arc::clone(&consumer));
        if let Err(err) = channel.add_receiver(Arc::clone(&consumer) as Arc<dyn Receiver>) {
            if let Err(cleanup) = consumer.close_consumer() {
                warn!(consumer = %id, %cleanup, "Failed to clean up consumer");
            }
            return Err(err);
        }
        debug!(session = %self.id, consumer = %id, channel = %channel.name(), "Created consumer");
        Ok(consumer)
    }

    async fn create_producer_delegate(&self, destination: Destination) -> Result<Arc<dyn ProducerDelegate>> {
        self.ensure_open()?;
        match &destination {
            Destination::Queue(name) => {
                self.core.destinations.queue(name)?;
            },
            Destination::Topic(name) => {
                self.core.destinations.topic(name)?;
            },
        }
        let id = ProducerId::new(self.core.registry.next_id());
        let producer = Arc::new(ServerProducer::new(
            id,
            destination,
            Arc::clone(&self.core),
            Arc::clone(&self.context),
        ));
        self.producers.insert(id, Arc::clone(&producer));
        debug!(session = %self.id, producer = %id, "Created producer");
        Ok(producer)
    }

    async fn create_browser_delegate(
        &self,
        destination: Destination,
        selector: Option<String>,
    ) -> Result<Arc<dyn BrowserDelegate>> {
        self.ensure_open()?;
        let Destination::Queue(name) = &destination else {
            return Err(Error::invalid_destination(format!("cannot browse {destination}")));
        };
        let channel = self.core.destinations.queue(name)?;
        let selector = Selector::parse_optional(selector.as_deref())?;
        let id = BrowserId::new(self.core.registry.next_id());
        let browser = Arc::new(ServerBrowser::new(id, channel, selector, Arc::clone(&self.context))?);
        self.browsers.insert(id, Arc::clone(&browser));
        Ok(browser)
    }

    async fn acknowledge(&self, ack: AckInfo) -> Result<()> {
        self.ensure_open()?;
        self.require_consumer(ack.consumer_id)?.acknowledge(ack.message_id, None)
    }

    async fn acknowledge_batch(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.ensure_open()?;
        for ack in acks {
            self.require_consumer(ack.consumer_id)?.acknowledge(ack.message_id, None)?;
        }
        Ok(())
    }

    async fn cancel_deliveries(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.ensure_open()?;
        let mut first_error = None;
        for ack in acks {
            let outcome = self.require_consumer(ack.consumer_id).and_then(|c| c.cancel(ack.message_id));
            if let Err(err) = outcome {
                warn!(session = %self.id, message_id = %ack.message_id, %err, "Failed to cancel delivery");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn send_unacked_ack_infos(&self, acks: Vec<AckInfo>) -> Result<()> {
        self.ensure_open()?;
        let total = acks.len();
        let mut claimed = 0;
        for ack in acks {
            let outcome = self.require_consumer(ack.consumer_id).and_then(|c| c.claim(ack.message_id));
            match outcome {
                Ok(()) => claimed += 1,
                Err(err) => {
                    warn!(session = %self.id, message_id = %ack.message_id, %err, "Skipping unknown delivery");
                },
            }
        }
        debug!(session = %self.id, claimed, total, "Restored unacknowledged deliveries");
        Ok(())
    }

    async fn unsubscribe(&self, subscription_name: &str) -> Result<()> {
        self.ensure_open()?;
        let client_id = self
            .context
            .client_id()
            .ok_or_else(|| Error::illegal_state("unsubscribe requires a client id"))?;
        self.core.destinations.unsubscribe(&client_id, subscription_name)
    }

    async fn close(&self) -> Result<()> {
        self.close_session()
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("transacted", &self.transacted)
            .field("ack_mode", &self.ack_mode)
            .field("consumers", &self.consumers.len())
            .finish()
    }
}
