//! Client-side mirrors of server endpoints.
//!
//! Every mirror carries what the client configured (destination, selector,
//! ack mode, unacknowledged deliveries, ...) so the endpoint can be rebuilt on
//! another server. `copy_state_from` adopts the server-assigned identity of a
//! freshly created counterpart and keeps everything else.

use courier_core::{
    delegate::{AckInfo, ClientDelivery, ConsumerSpec},
    types::{BrowserId, ConnectionId, ConsumerId, ProducerId, SessionId},
    AckMode, Destination, ServerId,
};

/// Failover progress of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverState {
    /// Attached to a live server
    #[default]
    Connected,
    /// A fault was seen; looking up the failover target
    SelectingTarget,
    /// Asking a server for a connection; `hop` counts followed redirects
    Reconnecting {
        /// Redirects followed so far
        hop: u32,
    },
    /// Rebuilding sessions, consumers, producers and browsers
    ReplayingState,
    /// Failover gave up; the connection is dead
    Failed,
}

impl FailoverState {
    /// Whether a failover is in progress.
    #[must_use]
    pub fn is_failing_over(&self) -> bool {
        matches!(
            self,
            FailoverState::SelectingTarget | FailoverState::Reconnecting { .. } | FailoverState::ReplayingState
        )
    }
}

/// Connection attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Server currently hosting the connection
    pub server_id: ServerId,
    /// Server-assigned connection id
    pub connection_id: ConnectionId,
    /// User the connection was opened for
    pub username: Option<String>,
    /// Password used to open the connection
    pub password: Option<String>,
    /// Client id, once set
    pub client_id: Option<String>,
    /// Whether the application started delivery
    pub started: bool,
}

impl ConnectionState {
    /// State of a freshly opened connection.
    #[must_use]
    pub fn new(
        server_id: ServerId,
        connection_id: ConnectionId,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self { server_id, connection_id, username, password, client_id: None, started: false }
    }

    /// Adopt the identity of `new`.
    pub fn copy_state_from(&mut self, new: &ConnectionState) {
        self.server_id = new.server_id;
        self.connection_id = new.connection_id;
    }
}

/// Session attributes and the deliveries it has not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Server-assigned session id
    pub session_id: SessionId,
    /// Whether the session is transacted
    pub transacted: bool,
    /// Acknowledgement mode
    pub ack_mode: AckMode,
    /// Whether the session takes part in XA transactions
    pub xa: bool,
    /// Received but unacknowledged deliveries, in receipt order
    pub unacked: Vec<ClientDelivery>,
}

impl SessionState {
    /// State of a freshly created session.
    #[must_use]
    pub fn new(session_id: SessionId, transacted: bool, ack_mode: AckMode, xa: bool) -> Self {
        Self { session_id, transacted, ack_mode, xa, unacked: Vec::new() }
    }

    /// Adopt the identity of `new`.
    pub fn copy_state_from(&mut self, new: &SessionState) {
        self.session_id = new.session_id;
    }

    /// Acknowledgements for every unacknowledged delivery.
    #[must_use]
    pub fn ack_infos(&self) -> Vec<AckInfo> {
        self.unacked.iter().map(ClientDelivery::ack_info).collect()
    }

    /// Forget deliveries of non-persistent messages; returns how many went.
    pub fn remove_non_persistent(&mut self) -> usize {
        let before = self.unacked.len();
        self.unacked.retain(|delivery| delivery.message.persistent);
        before - self.unacked.len()
    }

    /// Point deliveries of consumer `old` at consumer `new`.
    pub fn remap_consumer(&mut self, old: ConsumerId, new: ConsumerId) {
        for delivery in self.unacked.iter_mut().filter(|d| d.consumer_id == old) {
            delivery.consumer_id = new;
        }
    }
}

/// Consumer attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerState {
    /// Server-assigned consumer id
    pub consumer_id: ConsumerId,
    /// How the consumer was created
    pub spec: ConsumerSpec,
}

impl ConsumerState {
    /// State of a freshly created consumer.
    #[must_use]
    pub fn new(consumer_id: ConsumerId, spec: ConsumerSpec) -> Self {
        Self { consumer_id, spec }
    }

    /// Adopt the identity of `new`.
    pub fn copy_state_from(&mut self, new: &ConsumerState) {
        self.consumer_id = new.consumer_id;
    }

    /// Whether the consumer backs a durable subscription.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.spec.subscription_name.is_some()
    }
}

/// Producer attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerState {
    /// Server-assigned producer id
    pub producer_id: ProducerId,
    /// Destination every message is sent to
    pub destination: Destination,
}

impl ProducerState {
    /// State of a freshly created producer.
    #[must_use]
    pub fn new(producer_id: ProducerId, destination: Destination) -> Self {
        Self { producer_id, destination }
    }

    /// Adopt the identity of `new`.
    pub fn copy_state_from(&mut self, new: &ProducerState) {
        self.producer_id = new.producer_id;
    }
}

/// Browser attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserState {
    /// Server-assigned browser id
    pub browser_id: BrowserId,
    /// Browsed queue
    pub destination: Destination,
    /// Optional selector
    pub selector: Option<String>,
}

impl BrowserState {
    /// State of a freshly created browser.
    #[must_use]
    pub fn new(browser_id: BrowserId, destination: Destination, selector: Option<String>) -> Self {
        Self { browser_id, destination, selector }
    }

    /// Adopt the identity of `new`.
    pub fn copy_state_from(&mut self, new: &BrowserState) {
        self.browser_id = new.browser_id;
    }
}
