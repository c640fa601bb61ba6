//! Capability interfaces shared by the client and the server.
//!
//! Every client-visible entity (connection factory, connection, session,
//! consumer, producer, browser) is reached through one of these traits. The
//! in-VM server implements them directly; client-side decorators such as the
//! acknowledgement-mode session interceptor implement the same trait around an
//! inner delegate, and the failover coordinator swaps inner delegates when a
//! connection moves to another server.

use crate::{
    message::{Destination, Message, MessageId},
    types::{AckMode, BrowserId, ConnectionId, ConsumerId, ProducerId, ServerId, SessionId, Xid},
    Error, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Acknowledgement of one delivered message by one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckInfo {
    /// Acknowledged message
    pub message_id: MessageId,
    /// Consumer the message was delivered to
    pub consumer_id: ConsumerId,
    /// Whether the message is persistent; non-persistent acks are not replayed on failover
    pub persistent: bool,
}

impl AckInfo {
    /// Create an ack info.
    #[must_use]
    pub fn new(message_id: MessageId, consumer_id: ConsumerId, persistent: bool) -> Self {
        Self { message_id, consumer_id, persistent }
    }
}

/// A message pushed from a server consumer to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDelivery {
    /// The delivered message
    pub message: Message,
    /// Consumer the message was delivered to
    pub consumer_id: ConsumerId,
    /// Number of delivery attempts including this one
    pub delivery_count: u32,
}

impl ClientDelivery {
    /// Acknowledgement matching this delivery.
    #[must_use]
    pub fn ack_info(&self) -> AckInfo {
        AckInfo::new(self.message.id, self.consumer_id, self.message.persistent)
    }
}

/// Everything needed to (re)create a consumer on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    /// Queue or topic to consume from
    pub destination: Destination,
    /// Optional message selector
    pub selector: Option<String>,
    /// Suppress messages published by the same connection
    pub no_local: bool,
    /// Durable subscription name, topics only
    pub subscription_name: Option<String>,
    /// Whether the consumer backs a connection consumer
    pub connection_consumer: bool,
}

impl ConsumerSpec {
    /// Plain consumer on `destination`.
    #[must_use]
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            selector: None,
            no_local: false,
            subscription_name: None,
            connection_consumer: false,
        }
    }

    /// Set the selector.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the no-local flag.
    #[must_use]
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Make this a durable subscription.
    #[must_use]
    pub fn with_subscription_name(mut self, name: impl Into<String>) -> Self {
        self.subscription_name = Some(name.into());
        self
    }

    /// Mark this consumer as backing a connection consumer.
    #[must_use]
    pub fn as_connection_consumer(mut self) -> Self {
        self.connection_consumer = true;
        self
    }
}

/// Sends and acknowledgements accumulated by a client transaction branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// Messages to enqueue
    pub sends: Vec<Message>,
    /// Deliveries to acknowledge
    pub acks: Vec<AckInfo>,
}

impl TransactionPayload {
    /// Whether the payload carries no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.acks.is_empty()
    }
}

/// A transaction completion request sent from a client to its server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionRequest {
    /// Apply `payload` atomically in one phase
    OnePhaseCommit {
        /// Work to apply
        payload: TransactionPayload,
    },
    /// Stage `payload` under `xid` and prepare it
    Prepare {
        /// Branch identifier
        xid: Xid,
        /// Work to prepare
        payload: TransactionPayload,
    },
    /// Commit a prepared branch
    Commit {
        /// Branch identifier
        xid: Xid,
    },
    /// Roll back a prepared branch
    Rollback {
        /// Branch identifier
        xid: Xid,
    },
}

/// Outcome of asking a factory for a connection.
///
/// For a failover attempt a server either hands out a delegate (it took over
/// the failed server) or names the node that actually did. `None` as the
/// actual node is the wire-level `-1`: no failover happened at all.
#[derive(Clone)]
pub struct CreateConnectionResult {
    /// Delegate for the new connection, if this server accepted it
    pub delegate: Option<Arc<dyn ConnectionDelegate>>,
    /// Node the client should try instead
    pub actual_failover_node: Option<ServerId>,
}

impl CreateConnectionResult {
    /// The server accepted the connection.
    #[must_use]
    pub fn connected(delegate: Arc<dyn ConnectionDelegate>) -> Self {
        Self { delegate: Some(delegate), actual_failover_node: None }
    }

    /// The server redirects the client to `node`.
    #[must_use]
    pub fn redirect(node: ServerId) -> Self {
        Self { delegate: None, actual_failover_node: Some(node) }
    }

    /// The server knows of no failover for the hinted server.
    #[must_use]
    pub fn no_failover() -> Self {
        Self { delegate: None, actual_failover_node: None }
    }
}

impl fmt::Debug for CreateConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateConnectionResult")
            .field("connected", &self.delegate.is_some())
            .field("actual_failover_node", &self.actual_failover_node)
            .finish()
    }
}

/// Receives messages pushed by the server for every consumer of a connection.
pub trait DeliveryListener: Send + Sync {
    /// Called once per delivered message. Must not block.
    fn on_delivery(&self, delivery: ClientDelivery);
}

/// Notified when the transport under a connection fails.
pub trait FailureListener: Send + Sync {
    /// Called from the transport's context. Must not block.
    fn connection_failed(&self, connection_id: ConnectionId, cause: &Error);
}

/// Creates connections against one server.
#[async_trait]
pub trait ConnectionFactoryDelegate: Send + Sync {
    /// Server this factory connects to.
    fn server_id(&self) -> ServerId;

    /// Create a connection. `failed_server_id` is `None` for a fresh connection
    /// and names the failed server during failover.
    async fn create_connection_delegate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
        failed_server_id: Option<ServerId>,
    ) -> Result<CreateConnectionResult>;
}

/// Server side of a connection.
#[async_trait]
pub trait ConnectionDelegate: Send + Sync {
    /// Server hosting this connection.
    fn server_id(&self) -> ServerId;

    /// Server-assigned connection id.
    fn connection_id(&self) -> ConnectionId;

    /// Set the client id. Only allowed once, before any session is created.
    async fn set_client_id(&self, client_id: &str) -> Result<()>;

    /// Create a session.
    async fn create_session_delegate(
        &self,
        transacted: bool,
        ack_mode: AckMode,
        xa: bool,
    ) -> Result<Arc<dyn SessionDelegate>>;

    /// Start delivery to consumers.
    async fn start(&self) -> Result<()>;

    /// Pause delivery to consumers.
    async fn stop(&self) -> Result<()>;

    /// Close the connection and everything it owns.
    async fn close(&self) -> Result<()>;

    /// Complete a local or XA transaction.
    async fn send_transaction(&self, request: TransactionRequest) -> Result<()>;

    /// Prepared but unresolved transaction branches on this server.
    async fn prepared_transactions(&self) -> Result<Vec<Xid>>;

    /// Install the listener receiving every delivery for this connection.
    fn set_delivery_listener(&self, listener: Arc<dyn DeliveryListener>);

    /// Register a transport failure listener.
    fn add_failure_listener(&self, listener: Arc<dyn FailureListener>);
}

/// Server side of a session.
#[async_trait]
pub trait SessionDelegate: Send + Sync {
    /// Server-assigned session id.
    fn session_id(&self) -> SessionId;

    /// Create a consumer.
    async fn create_consumer_delegate(
        &self,
        spec: ConsumerSpec,
    ) -> Result<Arc<dyn ConsumerDelegate>>;

    /// Create a producer.
    async fn create_producer_delegate(
        &self,
        destination: Destination,
    ) -> Result<Arc<dyn ProducerDelegate>>;

    /// Create a queue browser.
    async fn create_browser_delegate(
        &self,
        destination: Destination,
        selector: Option<String>,
    ) -> Result<Arc<dyn BrowserDelegate>>;

    /// Acknowledge one delivery.
    async fn acknowledge(&self, ack: AckInfo) -> Result<()>;

    /// Acknowledge several deliveries in order.
    async fn acknowledge_batch(&self, acks: Vec<AckInfo>) -> Result<()>;

    /// Return deliveries to their channels for redelivery.
    async fn cancel_deliveries(&self, acks: Vec<AckInfo>) -> Result<()>;

    /// After failover, tell the server which deliveries the client still holds.
    async fn send_unacked_ack_infos(&self, acks: Vec<AckInfo>) -> Result<()>;

    /// Delete a durable subscription owned by this connection's client id.
    async fn unsubscribe(&self, subscription_name: &str) -> Result<()>;

    /// Close the session and everything it owns.
    async fn close(&self) -> Result<()>;
}

/// Server side of a consumer.
#[async_trait]
pub trait ConsumerDelegate: Send + Sync {
    /// Server-assigned consumer id.
    fn consumer_id(&self) -> ConsumerId;

    /// Close the consumer, returning its in-flight deliveries to the channel.
    async fn close(&self) -> Result<()>;
}

/// Server side of a producer.
#[async_trait]
pub trait ProducerDelegate: Send + Sync {
    /// Server-assigned producer id.
    fn producer_id(&self) -> ProducerId;

    /// Send a message outside any transaction.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the producer.
    async fn close(&self) -> Result<()>;
}

/// Server side of a queue browser.
#[async_trait]
pub trait BrowserDelegate: Send + Sync {
    /// Server-assigned browser id.
    fn browser_id(&self) -> BrowserId;

    /// Whether more messages are available.
    async fn has_next(&self) -> Result<bool>;

    /// Up to `max` further messages.
    async fn next_messages(&self, max: usize) -> Result<Vec<Message>>;

    /// Restart browsing from a fresh snapshot.
    async fn reset(&self) -> Result<()>;

    /// Close the browser.
    async fn close(&self) -> Result<()>;
}
