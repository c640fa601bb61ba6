//! Queues, topics and subscriptions.
//!
//! Every queue is one channel. A topic owns no channel of its own: each of its
//! subscriptions is a channel, and routing a message to a topic fans it out to
//! every subscription whose selector and no-local rule admit it.

use crate::{
    channel::{Channel, ChannelConfig},
    selector::{Filter, Selector},
    store::MessageStore,
    transaction::Transaction,
};
use courier_core::{
    types::{ChannelId, ConnectionId},
    Destination, Error, Message, Result,
};
use courier_storage::PersistenceManager;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info};

/// Message property carrying the id of the connection that sent it.
pub const ORIGIN_PROPERTY: &str = "courier.origin.connection";

/// One topic subscription and its channel.
pub struct Subscription {
    topic: String,
    channel: Channel,
    selector: Option<Selector>,
    no_local: Option<ConnectionId>,
    durable: Option<(String, String)>,
}

impl Subscription {
    /// Channel holding the subscription's messages.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Selector applied at routing time.
    #[must_use]
    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    /// Whether the subscription survives its consumer.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Whether a message published to the topic belongs in this subscription.
    #[must_use]
    pub fn accepts(&self, message: &Message) -> bool {
        if let Some(connection) = self.no_local {
            if message.property(ORIGIN_PROPERTY) == Some(connection.to_string().as_str()) {
                return false;
            }
        }
        self.selector.as_ref().map_or(true, |selector| selector.matches(message))
    }

    fn same_definition(&self, topic: &str, selector: Option<&Selector>) -> bool {
        self.topic == topic && self.selector.as_ref().map(Selector::source) == selector.map(Selector::source)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("channel", &self.channel.name())
            .field("durable", &self.durable)
            .finish()
    }
}

/// Resolves destinations to channels and owns subscription identity.
pub struct DestinationManager {
    store: MessageStore,
    pm: PersistenceManager,
    config: ChannelConfig,
    next_channel_id: AtomicU64,
    queues: DashMap<String, Channel>,
    topics: DashMap<String, Vec<Arc<Subscription>>>,
    durables: DashMap<(String, String), Arc<Subscription>>,
    channels: DashMap<String, Channel>,
}

impl DestinationManager {
    /// Create an empty manager. Every channel it creates uses `config`.
    #[must_use]
    pub fn new(store: MessageStore, pm: PersistenceManager, config: ChannelConfig) -> Self {
        Self {
            store,
            pm,
            config,
            next_channel_id: AtomicU64::new(1),
            queues: DashMap::new(),
            topics: DashMap::new(),
            durables: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// Message body cache shared by every channel.
    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    fn new_channel(&self, name: impl FnOnce(ChannelId) -> String, recoverable: bool) -> Result<Channel> {
        let id = ChannelId::new(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let config = ChannelConfig::new(self.config.paging, recoverable);
        let channel = Channel::new(id, name(id), config, self.store.clone(), self.pm.clone())?;
        if recoverable {
            channel.recover()?;
        }
        self.channels.insert(channel.name().to_string(), channel.clone());
        Ok(channel)
    }

    fn drop_channel(&self, channel: &Channel) -> Result<()> {
        channel.remove_all_references()?;
        channel.close()?;
        self.channels.remove(channel.name());
        Ok(())
    }

    // ---- queues --------------------------------------------------------

    /// Deploy a queue, recovering its stored references. Deploying an
    /// existing queue returns it.
    ///
    /// # Errors
    /// `Storage` when recovery fails.
    pub fn create_queue(&self, name: &str) -> Result<Channel> {
        let destination = Destination::queue(name)?;
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let channel = self.new_channel(|_| format!("queue.{name}"), self.config.recoverable)?;
                entry.insert(channel.clone());
                info!(destination = %destination, "Deployed queue");
                Ok(channel)
            },
        }
    }

    /// Undeploy a queue.
    ///
    /// # Errors
    /// `InvalidDestination` for an unknown queue, `IllegalState` while it
    /// still holds references.
    pub fn remove_queue(&self, name: &str) -> Result<()> {
        let channel = self.queue(name)?;
        let count = channel.message_count();
        if count > 0 {
            return Err(Error::illegal_state(format!("queue {name} still holds {count} messages")));
        }
        channel.close()?;
        self.channels.remove(channel.name());
        self.queues.remove(name);
        info!(queue = name, "Undeployed queue");
        Ok(())
    }

    /// The channel behind queue `name`.
    ///
    /// # Errors
    /// `InvalidDestination` when no such queue is deployed.
    pub fn queue(&self, name: &str) -> Result<Channel> {
        self.queues
            .get(name)
            .map(|channel| channel.clone())
            .ok_or_else(|| Error::invalid_destination(format!("no queue named {name}")))
    }

    // ---- topics --------------------------------------------------------

    /// Deploy a topic. Deploying an existing topic is a no-op.
    ///
    /// # Errors
    /// `InvalidDestination` for an invalid name.
    pub fn create_topic(&self, name: &str) -> Result<()> {
        let destination = Destination::topic(name)?;
        if let Entry::Vacant(entry) = self.topics.entry(name.to_string()) {
            entry.insert(Vec::new());
            info!(destination = %destination, "Deployed topic");
        }
        Ok(())
    }

    /// Undeploy a topic together with all of its subscriptions.
    ///
    /// # Errors
    /// `InvalidDestination` for an unknown topic, `IllegalState` while any
    /// subscription still holds references.
    pub fn remove_topic(&self, name: &str) -> Result<()> {
        let subscriptions = self.topic(name)?;
        if let Some(busy) = subscriptions.iter().find(|s| s.channel.message_count() > 0) {
            return Err(Error::illegal_state(format!(
                "subscription {} of topic {name} still holds messages",
                busy.channel.name()
            )));
        }
        for subscription in &subscriptions {
            subscription.channel.close()?;
            self.channels.remove(subscription.channel.name());
            if let Some(key) = &subscription.durable {
                self.durables.remove(key);
            }
        }
        self.topics.remove(name);
        info!(topic = name, "Undeployed topic");
        Ok(())
    }

    /// Current subscriptions of topic `name`.
    ///
    /// # Errors
    /// `InvalidDestination` when no such topic is deployed.
    pub fn topic(&self, name: &str) -> Result<Vec<Arc<Subscription>>> {
        self.topics
            .get(name)
            .map(|subscriptions| subscriptions.clone())
            .ok_or_else(|| Error::invalid_destination(format!("no topic named {name}")))
    }

    // ---- routing -------------------------------------------------------

    /// Route `message` to its destination, returning the number of channels
    /// that took it.
    ///
    /// # Errors
    /// `InvalidDestination` for an unknown destination; channel errors
    /// propagate.
    pub fn route(&self, message: Message, tx: Option<&Transaction>) -> Result<usize> {
        match message.destination.clone() {
            Destination::Queue(name) => {
                let channel = self.queue(&name)?;
                channel.handle(self.store.reference(message), tx)?;
                Ok(1)
            },
            Destination::Topic(name) => {
                let subscriptions = self.topic(&name)?;
                let message = Arc::new(message);
                let mut routed = 0;
                for subscription in subscriptions.iter().filter(|s| s.accepts(&message)) {
                    subscription.channel.handle(self.store.reference(Arc::clone(&message)), tx)?;
                    routed += 1;
                }
                debug!(topic = %name, routed, "Published message");
                Ok(routed)
            },
        }
    }

    // ---- subscriptions -------------------------------------------------

    /// Create a subscription that lives as long as its consumer.
    ///
    /// # Errors
    /// `InvalidDestination` for an unknown topic.
    pub fn create_subscription(
        &self,
        topic: &str,
        selector: Option<Selector>,
        no_local: Option<ConnectionId>,
    ) -> Result<Arc<Subscription>> {
        let mut subscriptions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::invalid_destination(format!("no topic named {topic}")))?;
        let channel = self.new_channel(|id| format!("tmp.{topic}.{id}"), false)?;
        let subscription =
            Arc::new(Subscription { topic: topic.to_string(), channel, selector, no_local, durable: None });
        subscriptions.push(Arc::clone(&subscription));
        debug!(topic, channel = %subscription.channel.name(), "Created subscription");
        Ok(subscription)
    }

    /// Delete a non-durable subscription and whatever it still holds.
    ///
    /// # Errors
    /// `IllegalState` while deliveries are outstanding.
    pub fn remove_subscription(&self, subscription: &Subscription) -> Result<()> {
        if let Some(mut subscriptions) = self.topics.get_mut(&subscription.topic) {
            subscriptions.retain(|s| s.channel.id() != subscription.channel.id());
        }
        self.drop_channel(&subscription.channel)?;
        debug!(channel = %subscription.channel.name(), "Removed subscription");
        Ok(())
    }

    /// Get or create the durable subscription `name` of `client_id`.
    ///
    /// An existing subscription with a different topic or selector is
    /// replaced, dropping its messages.
    ///
    /// # Errors
    /// `InvalidDestination` for an unknown topic, `IllegalState` when the
    /// subscription must be replaced while a consumer is attached.
    pub fn durable_subscription(
        &self,
        client_id: &str,
        name: &str,
        topic: &str,
        selector: Option<Selector>,
        no_local: Option<ConnectionId>,
    ) -> Result<Arc<Subscription>> {
        let key = (client_id.to_string(), name.to_string());
        if let Some(existing) = self.durables.get(&key).map(|s| Arc::clone(&s)) {
            if existing.same_definition(topic, selector.as_ref()) {
                return Ok(existing);
            }
            if existing.channel.receiver_count() > 0 {
                return Err(Error::illegal_state(format!(
                    "durable subscription {name} of {client_id} has an active consumer"
                )));
            }
            info!(client_id, subscription = name, "Durable subscription changed, recreating");
            self.remove_durable(&key, &existing)?;
        }

        let mut subscriptions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::invalid_destination(format!("no topic named {topic}")))?;
        let channel = self.new_channel(|_| format!("sub.{client_id}.{name}"), self.config.recoverable)?;
        let subscription = Arc::new(Subscription {
            topic: topic.to_string(),
            channel,
            selector,
            no_local,
            durable: Some(key.clone()),
        });
        subscriptions.push(Arc::clone(&subscription));
        drop(subscriptions);
        self.durables.insert(key, Arc::clone(&subscription));
        info!(client_id, subscription = name, topic, "Created durable subscription");
        Ok(subscription)
    }

    /// Look up a durable subscription.
    #[must_use]
    pub fn find_durable_subscription(&self, client_id: &str, name: &str) -> Option<Arc<Subscription>> {
        self.durables.get(&(client_id.to_string(), name.to_string())).map(|s| Arc::clone(&s))
    }

    /// Delete a durable subscription and its messages.
    ///
    /// # Errors
    /// `InvalidDestination` when unknown, `IllegalState` while a consumer is
    /// attached or deliveries are outstanding.
    pub fn unsubscribe(&self, client_id: &str, name: &str) -> Result<()> {
        let key = (client_id.to_string(), name.to_string());
        let subscription = self
            .durables
            .get(&key)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| Error::invalid_destination(format!("no durable subscription {name} for {client_id}")))?;
        if subscription.channel.receiver_count() > 0 || subscription.channel.delivering_count() > 0 {
            return Err(Error::illegal_state(format!("durable subscription {name} is in use")));
        }
        self.remove_durable(&key, &subscription)?;
        info!(client_id, subscription = name, "Unsubscribed");
        Ok(())
    }

    fn remove_durable(&self, key: &(String, String), subscription: &Subscription) -> Result<()> {
        if let Some(mut subscriptions) = self.topics.get_mut(&subscription.topic) {
            subscriptions.retain(|s| s.channel.id() != subscription.channel.id());
        }
        self.drop_channel(&subscription.channel)?;
        self.durables.remove(key);
        Ok(())
    }

    // ---- lookup --------------------------------------------------------

    /// Channel by storage name.
    #[must_use]
    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.channels.get(name).map(|channel| channel.clone())
    }

    /// Every live channel.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Names of deployed queues.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of deployed topics.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for DestinationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationManager")
            .field("queues", &self.queues.len())
            .field("topics", &self.topics.len())
            .field("durables", &self.durables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_core::PagingConfig;
    use courier_storage::MemoryEnvironment;

    fn manager() -> DestinationManager {
        let env = Arc::new(MemoryEnvironment::new());
        DestinationManager::new(
            MessageStore::new(),
            PersistenceManager::new(env),
            ChannelConfig::new(PagingConfig::new(10, 5, 5), true),
        )
    }

    fn publish(dest: &Destination, color: &str) -> Message {
        Message::builder(dest.clone())
            .payload(Bytes::from_static(b"x"))
            .property("color", color)
            .build()
            .unwrap()
    }

    #[test]
    fn test_queue_lookup() {
        let manager = manager();
        let queue = manager.create_queue("orders").unwrap();
        assert_eq!(queue.name(), "queue.orders");
        assert_eq!(manager.create_queue("orders").unwrap().id(), queue.id());
        assert!(matches!(manager.queue("missing"), Err(Error::InvalidDestination { .. })));
        assert!(manager.channel_by_name("queue.orders").is_some());
    }

    #[test]
    fn test_remove_queue_with_messages_fails() {
        let manager = manager();
        manager.create_queue("q").unwrap();
        let dest = Destination::queue("q").unwrap();
        manager.route(Message::new(dest, Bytes::new()), None).unwrap();
        assert!(manager.remove_queue("q").unwrap_err().is_illegal_state());

        manager.queue("q").unwrap().remove_all_references().unwrap();
        manager.remove_queue("q").unwrap();
        assert!(manager.queue("q").is_err());
    }

    #[test]
    fn test_topic_fan_out_applies_selectors() {
        let manager = manager();
        manager.create_topic("prices").unwrap();
        let all = manager.create_subscription("prices", None, None).unwrap();
        let red = manager
            .create_subscription("prices", Some(Selector::parse("color = 'red'").unwrap()), None)
            .unwrap();

        let dest = Destination::topic("prices").unwrap();
        assert_eq!(manager.route(publish(&dest, "red"), None).unwrap(), 2);
        assert_eq!(manager.route(publish(&dest, "blue"), None).unwrap(), 1);
        assert_eq!(all.channel().message_count(), 2);
        assert_eq!(red.channel().message_count(), 1);
        // one body per published message
        assert_eq!(manager.store().size(), 2);
    }

    #[test]
    fn test_no_local_skips_own_messages() {
        let manager = manager();
        manager.create_topic("chat").unwrap();
        let sub = manager.create_subscription("chat", None, Some(ConnectionId::new(7))).unwrap();
        let dest = Destination::topic("chat").unwrap();

        let own = Message::builder(dest.clone()).property(ORIGIN_PROPERTY, "7").build().unwrap();
        let other = Message::builder(dest).property(ORIGIN_PROPERTY, "8").build().unwrap();
        manager.route(own, None).unwrap();
        manager.route(other, None).unwrap();
        assert_eq!(sub.channel().message_count(), 1);
    }

    #[test]
    fn test_durable_subscription_identity() {
        let manager = manager();
        manager.create_topic("news").unwrap();
        let first = manager.durable_subscription("client", "sub", "news", None, None).unwrap();
        let again = manager.durable_subscription("client", "sub", "news", None, None).unwrap();
        assert_eq!(first.channel().id(), again.channel().id());
        assert_eq!(first.channel().name(), "sub.client.sub");

        let changed = manager
            .durable_subscription("client", "sub", "news", Some(Selector::parse("a = 'b'").unwrap()), None)
            .unwrap();
        assert_ne!(changed.channel().id(), first.channel().id());
        assert_eq!(manager.topic("news").unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let manager = manager();
        manager.create_topic("news").unwrap();
        assert!(matches!(manager.unsubscribe("client", "sub"), Err(Error::InvalidDestination { .. })));

        manager.durable_subscription("client", "sub", "news", None, None).unwrap();
        manager.unsubscribe("client", "sub").unwrap();
        assert!(manager.find_durable_subscription("client", "sub").is_none());
        assert!(manager.topic("news").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_topic() {
        let manager = manager();
        assert!(matches!(
            manager.create_subscription("nope", None, None),
            Err(Error::InvalidDestination { .. })
        ));
        let dest = Destination::topic("nope").unwrap();
        assert!(matches!(manager.route(Message::new(dest, Bytes::new()), None), Err(Error::InvalidDestination { .. })));
    }
}
