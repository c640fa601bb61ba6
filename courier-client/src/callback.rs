//! Per-consumer buffers fed by the connection's delivery listener.

use courier_core::{
    delegate::{ClientDelivery, DeliveryListener},
    types::ConsumerId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Buffer of deliveries waiting to be received by one consumer.
#[derive(Debug)]
pub struct MessageCallbackHandler {
    consumer_id: Mutex<ConsumerId>,
    buffer: Mutex<VecDeque<ClientDelivery>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageCallbackHandler {
    /// Empty handler for `consumer_id`.
    #[must_use]
    pub fn new(consumer_id: ConsumerId) -> Self {
        Self {
            consumer_id: Mutex::new(consumer_id),
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Consumer this handler currently serves.
    #[must_use]
    pub fn consumer_id(&self) -> ConsumerId {
        *self.consumer_id.lock()
    }

    /// Number of buffered deliveries.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether the handler was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append a delivery from the server.
    pub fn handle_message(&self, delivery: ClientDelivery) {
        self.buffer.lock().push_back(delivery);
        self.notify.notify_one();
    }

    /// Put deliveries back in front of the buffer, keeping their order.
    /// Each counts as a further delivery attempt.
    pub fn redeliver(&self, deliveries: Vec<ClientDelivery>) {
        if deliveries.is_empty() {
            return;
        }
        {
            let mut buffer = self.buffer.lock();
            for mut delivery in deliveries.into_iter().rev() {
                delivery.delivery_count += 1;
                buffer.push_front(delivery);
            }
        }
        self.notify.notify_one();
    }

    /// Take the next delivery without waiting.
    pub fn try_receive(&self) -> Option<ClientDelivery> {
        self.buffer.lock().pop_front()
    }

    /// Wait for the next delivery, at most `timeout` when given.
    ///
    /// Returns `None` on timeout or once the handler is closed.
    pub async fn receive(&self, timeout: Option<Duration>) -> Option<ClientDelivery> {
        let wait = async {
            loop {
                if let Some(delivery) = self.try_receive() {
                    return Some(delivery);
                }
                if self.is_closed() {
                    return None;
                }
                self.notify.notified().await;
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.ok().flatten(),
            None => wait.await,
        }
    }

    /// Stop receiving and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.buffer.lock().clear();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Take over the identity of `new` after failover.
    ///
    /// Buffered deliveries came from the failed server and are dropped; the
    /// new server redelivers whatever survived. Returns how many were dropped.
    pub fn copy_state_from(&self, new: &MessageCallbackHandler) -> usize {
        *self.consumer_id.lock() = new.consumer_id();
        let mut buffer = self.buffer.lock();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }
}

#[derive(Debug, Default)]
struct Orphans {
    pending: HashMap<ConsumerId, Vec<ClientDelivery>>,
    retired: HashSet<ConsumerId>,
}

/// Routes deliveries of one connection to their consumers' handlers.
///
/// Deliveries for a consumer whose handler is not registered yet are held
/// until it registers; the server may deliver as soon as it creates the
/// consumer. Deliveries for unregistered consumers are dropped.
#[derive(Debug, Default)]
pub struct CallbackManager {
    handlers: DashMap<ConsumerId, Arc<MessageCallbackHandler>>,
    orphans: Mutex<Orphans>,
}

impl CallbackManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its consumer id.
    pub fn register_handler(&self, handler: Arc<MessageCallbackHandler>) {
        let consumer_id = handler.consumer_id();
        let mut orphans = self.orphans.lock();
        orphans.retired.remove(&consumer_id);
        for delivery in orphans.pending.remove(&consumer_id).unwrap_or_default() {
            handler.handle_message(delivery);
        }
        self.handlers.insert(consumer_id, handler);
    }

    /// Remove the handler of `consumer_id`.
    pub fn unregister_handler(&self, consumer_id: ConsumerId) -> Option<Arc<MessageCallbackHandler>> {
        let mut orphans = self.orphans.lock();
        orphans.pending.remove(&consumer_id);
        orphans.retired.insert(consumer_id);
        self.handlers.remove(&consumer_id).map(|(_, handler)| handler)
    }

    /// Handler of `consumer_id`.
    #[must_use]
    pub fn handler(&self, consumer_id: ConsumerId) -> Option<Arc<MessageCallbackHandler>> {
        self.handlers.get(&consumer_id).map(|h| Arc::clone(&h))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand deliveries back to their consumers, per consumer in the given order.
    pub fn redeliver(&self, deliveries: Vec<ClientDelivery>) {
        let mut grouped: Vec<(ConsumerId, Vec<ClientDelivery>)> = Vec::new();
        for delivery in deliveries {
            match grouped.iter_mut().find(|(id, _)| *id == delivery.consumer_id) {
                Some((_, group)) => group.push(delivery),
                None => grouped.push((delivery.consumer_id, vec![delivery])),
            }
        }
        for (consumer_id, group) in grouped {
            match self.handler(consumer_id) {
                Some(handler) => handler.redeliver(group),
                None => debug!(consumer = %consumer_id, dropped = group.len(), "Consumer gone, skipping redelivery"),
            }
        }
    }
}

impl DeliveryListener for CallbackManager {
    fn on_delivery(&self, delivery: ClientDelivery) {
        let consumer_id = delivery.consumer_id;
        if let Some(handler) = self.handler(consumer_id) {
            handler.handle_message(delivery);
            return;
        }
        let mut orphans = self.orphans.lock();
        // registration may have completed while we looked
        if let Some(handler) = self.handler(consumer_id) {
            handler.handle_message(delivery);
            return;
        }
        if orphans.retired.contains(&consumer_id) {
            trace!(consumer = %consumer_id, "Dropping delivery for closed consumer");
            return;
        }
        trace!(consumer = %consumer_id, "Holding delivery for unregistered consumer");
        orphans.pending.entry(consumer_id).or_default().push(delivery);
    }
}
