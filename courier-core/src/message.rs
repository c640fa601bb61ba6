//! Message types and utilities for the broker.

use crate::types::Timestamp;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// Default JMS priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Highest allowed priority.
pub const MAX_PRIORITY: u8 = 9;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a message ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID:{}", self.0)
    }
}

/// A logical destination: a point-to-point queue or a publish/subscribe topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Point-to-point queue
    Queue(String),
    /// Publish/subscribe topic
    Topic(String),
}

impl Destination {
    /// Create a queue destination.
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long or contains invalid characters.
    pub fn queue(name: impl Into<String>) -> crate::Result<Self> {
        Ok(Destination::Queue(validate_name(name.into())?))
    }

    /// Create a topic destination.
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long or contains invalid characters.
    pub fn topic(name: impl Into<String>) -> crate::Result<Self> {
        Ok(Destination::Topic(validate_name(name.into())?))
    }

    /// Destination name without its kind.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    /// Whether this destination is a queue.
    #[must_use]
    pub fn is_queue(&self) -> bool {
        matches!(self, Destination::Queue(_))
    }

    /// Whether this destination is a topic.
    #[must_use]
    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

fn validate_name(name: String) -> crate::Result<String> {
    if name.is_empty() {
        return Err(crate::Error::invalid_destination("destination name cannot be empty"));
    }

    if name.len() > 255 {
        return Err(crate::Error::invalid_destination(
            "destination name cannot exceed 255 characters",
        ));
    }

    // Alphanumeric, hyphens, underscores, dots
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(crate::Error::invalid_destination(format!(
            "destination name '{name}' contains invalid characters"
        )));
    }

    Ok(name)
}

/// Immutable message: payload plus headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Destination the message was sent to
    pub destination: Destination,

    /// Message payload (zero-copy)
    pub payload: Bytes,

    /// Priority, 0 (lowest) to 9
    pub priority: u8,

    /// Whether the message must survive a broker restart
    pub persistent: bool,

    /// Time the message was created
    pub timestamp: Timestamp,

    /// Time after which the message must not be delivered
    pub expiration: Option<Timestamp>,

    /// Earliest time the message may be delivered
    pub scheduled_delivery: Option<Timestamp>,

    /// Application properties
    pub properties: HashMap<String, String>,
}

impl Message {
    /// Create a non-persistent message with default headers.
    #[must_use]
    pub fn new(destination: Destination, payload: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            destination,
            payload,
            priority: DEFAULT_PRIORITY,
            persistent: false,
            timestamp: Utc::now(),
            expiration: None,
            scheduled_delivery: None,
            properties: HashMap::new(),
        }
    }

    /// Create a message builder for more complex construction.
    #[must_use]
    pub fn builder(destination: Destination) -> MessageBuilder {
        MessageBuilder::new(destination)
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Get a property value by key.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the message has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    /// Whether the message has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    destination: Destination,
    payload: Bytes,
    priority: u8,
    persistent: bool,
    expiration: Option<Timestamp>,
    scheduled_delivery: Option<Timestamp>,
    properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Start building a message for `destination`.
    #[must_use]
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            payload: Bytes::new(),
            priority: DEFAULT_PRIORITY,
            persistent: false,
            expiration: None,
            scheduled_delivery: None,
            properties: HashMap::new(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the message persistent (reliable).
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set an absolute expiration time.
    #[must_use]
    pub fn expiration(mut self, expiration: Timestamp) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Defer delivery until `at`.
    #[must_use]
    pub fn scheduled_delivery(mut self, at: Timestamp) -> Self {
        self.scheduled_delivery = Some(at);
        self
    }

    /// Add an application property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build the message.
    ///
    /// # Errors
    /// Returns an error if the priority is out of range.
    pub fn build(self) -> crate::Result<Message> {
        if self.priority > MAX_PRIORITY {
            return Err(crate::Error::InvalidMessage {
                message: format!("priority {} exceeds {}", self.priority, MAX_PRIORITY),
            });
        }

        Ok(Message {
            id: MessageId::new(),
            destination: self.destination,
            payload: self.payload,
            priority: self.priority,
            persistent: self.persistent,
            timestamp: Utc::now(),
            expiration: self.expiration,
            scheduled_delivery: self.scheduled_delivery,
            properties: self.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_destination_validation() {
        assert!(Destination::queue("orders.eu").is_ok());
        assert!(Destination::topic("").is_err());
        assert!(matches!(
            Destination::queue("bad name"),
            Err(crate::Error::InvalidDestination { .. })
        ));
        assert_eq!(Destination::topic("news").unwrap().to_string(), "topic://news");
    }

    #[test]
    fn test_builder_defaults() {
        let dest = Destination::queue("q").unwrap();
        let msg = Message::builder(dest.clone()).payload("a").build().unwrap();
        assert_eq!(msg.destination, dest);
        assert_eq!(msg.priority, DEFAULT_PRIORITY);
        assert!(!msg.persistent);
        assert_eq!(msg.payload, Bytes::from("a"));
    }

    #[test]
    fn test_builder_rejects_bad_priority() {
        let dest = Destination::queue("q").unwrap();
        assert!(Message::builder(dest).priority(10).build().is_err());
    }

    #[test]
    fn test_expiration() {
        let dest = Destination::queue("q").unwrap();
        let past = Utc::now() - Duration::seconds(5);
        let msg = Message::builder(dest.clone()).expiration(past).build().unwrap();
        assert!(msg.is_expired());
        assert!(!Message::new(dest, Bytes::new()).is_expired());
    }

    #[test]
    fn test_message_ids_unique() {
        let dest = Destination::queue("q").unwrap();
        let a = Message::new(dest.clone(), Bytes::new());
        let b = Message::new(dest, Bytes::new());
        assert_ne!(a.id, b.id);
    }
}
