//! Application-facing connection.

use crate::{
    callback::CallbackManager,
    session::ClientSession,
    state::{ConnectionState, FailoverState},
    tx::ResourceManager,
};
use courier_core::{
    config::ClientConfig,
    delegate::{ConnectionDelegate, ConnectionFactoryDelegate, FailureListener},
    types::ConnectionId,
    AckMode, Error, Result, ServerId,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, info, warn};

/// Receives connection problems the application cannot otherwise observe.
pub trait ExceptionListener: Send + Sync {
    /// Called once per reported fault.
    fn on_exception(&self, error: &Error);
}

/// What sessions and endpoints of a connection share with it.
pub(crate) struct ConnectionShared {
    delegate: RwLock<Arc<dyn ConnectionDelegate>>,
    pub(crate) callbacks: Arc<CallbackManager>,
    pub(crate) resource_manager: Arc<ResourceManager>,
    pub(crate) config: ClientConfig,
}

impl ConnectionShared {
    pub(crate) fn delegate(&self) -> Arc<dyn ConnectionDelegate> {
        Arc::clone(&self.delegate.read())
    }
}

struct ConnectionInner {
    shared: Arc<ConnectionShared>,
    state: RwLock<ConnectionState>,
    failover: Mutex<FailoverState>,
    sessions: Mutex<Vec<ClientSession>>,
    exception_listener: RwLock<Option<Arc<dyn ExceptionListener>>>,
    closed: AtomicBool,
}

/// A client connection.
///
/// Cloning is cheap; every clone is the same connection. The server-side
/// delegate underneath may be replaced by failover without the application
/// noticing.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<ConnectionInner>,
}

impl ClientConnection {
    /// Wrap an already created server connection.
    pub fn new(
        delegate: Arc<dyn ConnectionDelegate>,
        username: Option<&str>,
        password: Option<&str>,
        config: ClientConfig,
    ) -> Self {
        let callbacks = Arc::new(CallbackManager::new());
        delegate.set_delivery_listener(Arc::clone(&callbacks) as _);
        let state = ConnectionState::new(
            delegate.server_id(),
            delegate.connection_id(),
            username.map(str::to_string),
            password.map(str::to_string),
        );
        debug!(connection = %state.connection_id, server_id = %state.server_id, "Opened client connection");
        let shared = ConnectionShared {
            delegate: RwLock::new(delegate),
            callbacks,
            resource_manager: Arc::new(ResourceManager::new()),
            config,
        };
        Self {
            inner: Arc::new(ConnectionInner {
                shared: Arc::new(shared),
                state: RwLock::new(state),
                failover: Mutex::new(FailoverState::Connected),
                sessions: Mutex::new(Vec::new()),
                exception_listener: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open a connection through `factory`.
    ///
    /// # Errors
    /// Returns the factory's error, or [`Error::ConnectionFault`] if the
    /// server handed out no connection.
    pub async fn connect(
        factory: &dyn ConnectionFactoryDelegate,
        username: Option<&str>,
        password: Option<&str>,
        config: ClientConfig,
    ) -> Result<Self> {
        let result = factory.create_connection_delegate(username, password, None).await?;
        let delegate = result.delegate.ok_or_else(|| {
            Error::connection_fault(format!("server {} did not accept the connection", factory.server_id()))
        })?;
        Ok(Self::new(delegate, username, password, config))
    }

    /// Server currently hosting the connection.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.inner.state.read().server_id
    }

    /// Server-assigned connection id.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.state.read().connection_id
    }

    /// Client id, once set.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.state.read().client_id.clone()
    }

    /// Whether delivery was started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.state.read().started
    }

    /// Whether the connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    /// Current server connection.
    #[must_use]
    pub fn delegate(&self) -> Arc<dyn ConnectionDelegate> {
        self.inner.shared.delegate()
    }

    /// Delivery routing of this connection.
    #[must_use]
    pub fn callbacks(&self) -> &Arc<CallbackManager> {
        &self.inner.shared.callbacks
    }

    /// Transaction branches of this connection.
    #[must_use]
    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.inner.shared.resource_manager
    }

    /// Open sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<ClientSession> {
        let mut sessions = self.inner.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("connection {} is closed", self.connection_id())));
        }
        if *self.inner.failover.lock() == FailoverState::Failed {
            return Err(Error::connection_fault(format!("connection {} failed", self.connection_id())));
        }
        Ok(())
    }

    /// Set the client id. Allowed once, before any session exists.
    ///
    /// # Errors
    /// Returns [`Error::IllegalState`] if the id is already set or a session exists.
    pub async fn set_client_id(&self, client_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.delegate().set_client_id(client_id).await?;
        self.inner.state.write().client_id = Some(client_id.to_string());
        Ok(())
    }

    /// Start delivery.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.delegate().start().await?;
        self.inner.state.write().started = true;
        Ok(())
    }

    /// Pause delivery.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.delegate().stop().await?;
        self.inner.state.write().started = false;
        Ok(())
    }

    /// Close the connection with all its sessions. Open transactions are discarded.
    ///
    /// # Errors
    /// Returns the server's error; the connection counts as closed regardless.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        for session in &sessions {
            session.close_local();
        }
        self.resource_manager().clear();
        debug!(connection = %self.connection_id(), "Closing client connection");
        self.delegate().close().await
    }

    /// Create a session.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn create_session(&self, transacted: bool, ack_mode: AckMode) -> Result<ClientSession> {
        self.open_session(transacted, ack_mode, false).await
    }

    /// Create a session able to take part in XA transactions.
    ///
    /// # Errors
    /// Returns the server's error.
    pub async fn create_xa_session(&self) -> Result<ClientSession> {
        self.open_session(false, AckMode::AutoAcknowledge, true).await
    }

    async fn open_session(&self, transacted: bool, ack_mode: AckMode, xa: bool) -> Result<ClientSession> {
        self.ensure_open()?;
        let delegate = self.delegate().create_session_delegate(transacted, ack_mode, xa).await?;
        let session = ClientSession::new(delegate, transacted, ack_mode, xa, Arc::clone(&self.inner.shared));
        self.inner.sessions.lock().push(session.clone());
        Ok(session)
    }

    /// Install the listener for connection faults.
    pub fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *self.inner.exception_listener.write() = Some(listener);
    }

    /// Register a transport failure listener on the current server connection.
    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.delegate().add_failure_listener(listener);
    }

    /// Failover progress.
    #[must_use]
    pub fn failover_state(&self) -> FailoverState {
        *self.inner.failover.lock()
    }

    /// Claim the connection for a failover. Fails if one is already running,
    /// the connection already failed or it was closed.
    pub fn begin_failover(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.inner.failover.lock();
        if *state != FailoverState::Connected {
            return false;
        }
        *state = FailoverState::SelectingTarget;
        true
    }

    /// Record failover progress.
    pub fn set_failover_state(&self, state: FailoverState) {
        let mut current = self.inner.failover.lock();
        if *current != state {
            debug!(connection = %self.connection_id(), from = ?*current, to = ?state, "Failover state changed");
            *current = state;
        }
    }

    /// Attach the connection to `new` and adopt its identity.
    pub fn replace_delegate(&self, new: Arc<dyn ConnectionDelegate>) {
        new.set_delivery_listener(Arc::clone(&self.inner.shared.callbacks) as _);
        let new_state = ConnectionState::new(new.server_id(), new.connection_id(), None, None);
        let mut state = self.inner.state.write();
        info!(
            old = %state.connection_id,
            new = %new_state.connection_id,
            server_id = %new_state.server_id,
            "Connection moved to another server"
        );
        state.copy_state_from(&new_state);
        *self.inner.shared.delegate.write() = new;
    }

    /// Handle that does not keep the connection alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection { inner: Arc::downgrade(&self.inner) }
    }

    /// Hand `error` to the exception listener.
    pub fn report_exception(&self, error: &Error) {
        let listener = self.inner.exception_listener.read().clone();
        match listener {
            Some(listener) => listener.on_exception(error),
            None => warn!(connection = %self.connection_id(), %error, "Connection fault without exception listener"),
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ClientConnection")
            .field("connection_id", &state.connection_id)
            .field("server_id", &state.server_id)
            .field("started", &state.started)
            .field("failover", &*self.inner.failover.lock())
            .finish()
    }
}

/// Non-owning handle to a [`ClientConnection`], for listeners registered on
/// server connections that may outlive it.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    /// The connection, unless it was dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<ClientConnection> {
        self.inner.upgrade().map(|inner| ClientConnection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection").field("alive", &(self.inner.strong_count() > 0)).finish()
    }
}
