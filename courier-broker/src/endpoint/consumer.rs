use super::{ConnectionContext, ServerCore, ServerSession};
use crate::{
    channel::Channel,
    delivery::Delivery,
    destination::Subscription,
    receiver::{Offer, Receiver},
    selector::{Filter, Selector},
    transaction::Transaction,
};
use async_trait::async_trait;
use courier_core::{
    delegate::{ClientDelivery, ConsumerDelegate},
    types::ConsumerId,
    Error, Message, MessageId, Result,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, warn};

/// Server side of a consumer: a channel receiver that forwards deliveries to
/// its connection's delivery listener.
pub struct ServerConsumer {
    id: ConsumerId,
    core: Arc<ServerCore>,
    context: Arc<ConnectionContext>,
    session: Weak<ServerSession>,
    channel: Channel,
    selector: Option<Selector>,
    subscription: Option<Arc<Subscription>>,
    deliveries: Mutex<HashMap<MessageId, Delivery>>,
    closed: AtomicBool,
}

impl ServerConsumer {
    pub(crate) fn new(
        id: ConsumerId,
        core: Arc<ServerCore>,
        context: Arc<ConnectionContext>,
        session: Weak<ServerSession>,
        channel: Channel,
        selector: Option<Selector>,
        subscription: Option<Arc<Subscription>>,
    ) -> Self {
        Self {
            id,
            core,
            context,
            session,
            channel,
            selector,
            subscription,
            deliveries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Channel this consumer receives from.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Deliveries handed to the client and not yet completed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let mut deliveries = self.deliveries.lock();
        deliveries.retain(|_, delivery| !delivery.is_done());
        deliveries.len()
    }

    fn outstanding_delivery(&self, message_id: MessageId) -> Result<Delivery> {
        let mut deliveries = self.deliveries.lock();
        deliveries.retain(|_, delivery| !delivery.is_done());
        deliveries.get(&message_id).cloned().ok_or_else(|| {
            Error::illegal_state(format!("{message_id} is not outstanding on consumer {}", self.id))
        })
    }

    /// Acknowledge one outstanding delivery, optionally inside `tx`.
    pub(crate) fn acknowledge(&self, message_id: MessageId, tx: Option<&Transaction>) -> Result<()> {
        let delivery = self.outstanding_delivery(message_id)?;
        delivery.acknowledge(tx)?;
        if tx.is_none() {
            self.deliveries.lock().remove(&message_id);
        }
        Ok(())
    }

    /// Return one outstanding delivery to the channel.
    pub(crate) fn cancel(&self, message_id: MessageId) -> Result<()> {
        let delivery = self.outstanding_delivery(message_id)?;
        // cancelling may hand the message straight back to this consumer
        self.deliveries.lock().remove(&message_id);
        if let Err(err) = delivery.cancel() {
            self.deliveries.lock().entry(message_id).or_insert(delivery);
            return Err(err);
        }
        Ok(())
    }

    /// Adopt a delivery claimed on this consumer's behalf.
    pub(crate) fn track(&self, delivery: Delivery) {
        self.deliveries.lock().insert(delivery.message_id(), delivery);
    }

    /// Claim `message_id` from the channel for this consumer.
    pub(crate) fn claim(&self, message_id: MessageId) -> Result<()> {
        let delivery = self.channel.claim(message_id, self.id)?;
        self.track(delivery);
        Ok(())
    }

    pub(crate) fn close_consumer(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.channel.remove_receiver(self.id);
        let cancelled = self.channel.cancel_deliveries_for(self.id)?;
        self.deliveries.lock().clear();
        self.core.registry.remove_consumer(self.id);
        if let Some(session) = self.session.upgrade() {
            session.forget_consumer(self.id);
        }

        if let Some(subscription) = &self.subscription {
            if let Err(err) = self.core.destinations.remove_subscription(subscription) {
                warn!(consumer = %self.id, %err, "Failed to remove subscription");
            }
        }
        debug!(consumer = %self.id, cancelled, "Closed consumer");
        Ok(())
    }

    /// Start delivering again after the connection was started.
    pub(crate) fn prompt(&self) {
        if let Err(err) = self.channel.deliver() {
            warn!(consumer = %self.id, %err, "Prompt delivery failed");
        }
    }
}

impl Receiver for ServerConsumer {
    fn receiver_id(&self) -> ConsumerId {
        self.id
    }

    fn offer(&self, delivery: &Delivery) -> Offer {
        if self.closed.load(Ordering::Acquire) || !self.context.is_started() {
            return Offer::Busy;
        }
        let Some(listener) = self.context.listener() else {
            return Offer::Busy;
        };
        if let Some(selector) = &self.selector {
            if !selector.matches(delivery.message()) {
                return Offer::NotMatched;
            }
        }

        self.deliveries.lock().insert(delivery.message_id(), delivery.clone());
        listener.on_delivery(ClientDelivery {
            message: Message::clone(delivery.message()),
            consumer_id: self.id,
            delivery_count: delivery.delivery_count(),
        });
        Offer::Accepted
    }
}

#[async_trait]
impl ConsumerDelegate for ServerConsumer {
    fn consumer_id(&self) -> ConsumerId {
        self.id
    }

    async fn close(&self) -> Result<()> {
        self.close_consumer()
    }
}

impl fmt::Debug for ServerConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConsumer")
            .field("id", &self.id)
            .field("channel", &self.channel.name())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
