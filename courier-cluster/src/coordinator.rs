//! Client-side failover.
//!
//! A failure listener on every watched connection turns a transport fault
//! into an event for the coordinator's worker task. The worker looks up the
//! failed server's backup in the [`FailoverMap`], follows redirects until a
//! server accepts the connection, then rebuilds the connection's sessions,
//! producers, consumers and browsers there and restores the unacknowledged
//! persistent deliveries.

use crate::failover_map::FailoverMap;
use courier_client::{ClientConnection, ClientSession, FailoverState, MessageCallbackHandler, WeakConnection};
use courier_core::{
    delegate::{ConnectionDelegate, ConnectionFactoryDelegate, FailureListener, SessionDelegate},
    types::ConnectionId,
    Error, Result, ServerId,
};
use futures::future::try_join_all;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Connection attempts allowed per failover, the first one included.
pub const MAX_RECONNECT_HOP_COUNT: u32 = 10;

const EVENT_CAPACITY: usize = 64;

/// Result of one failover run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The connection now lives on `server_id`.
    FailedOver {
        /// Server that accepted the connection
        server_id: ServerId,
    },
    /// The servers know of no failover; the connection was left as it was.
    NoFailover,
    /// Another failover of the connection is running or it already failed.
    AlreadyInProgress,
}

/// Published after every failover run a watched connection goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    /// The connection moved to `server_id` under `connection_id`.
    Completed {
        /// Connection id before the failover
        previous: ConnectionId,
        /// Connection id on the new server
        connection_id: ConnectionId,
        /// New server
        server_id: ServerId,
    },
    /// No server took over; the original fault went to the exception listener.
    Abandoned {
        /// Affected connection
        connection_id: ConnectionId,
    },
    /// Failover failed for good.
    Failed {
        /// Affected connection
        connection_id: ConnectionId,
        /// What went wrong
        reason: String,
    },
}

struct FailureEvent {
    connection: WeakConnection,
    cause: Error,
}

struct FailoverListener {
    connection: WeakConnection,
    failures: mpsc::UnboundedSender<FailureEvent>,
}

impl FailureListener for FailoverListener {
    fn connection_failed(&self, connection_id: ConnectionId, cause: &Error) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if connection.connection_id() != connection_id {
            trace!(stale = %connection_id, current = %connection.connection_id(), "Ignoring fault of replaced connection");
            return;
        }
        if !connection.begin_failover() {
            debug!(connection = %connection_id, "Failover already running");
            return;
        }
        let event = FailureEvent { connection: self.connection.clone(), cause: cause.clone() };
        if self.failures.send(event).is_err() {
            warn!(connection = %connection_id, "Failover coordinator stopped");
            connection.set_failover_state(FailoverState::Failed);
            connection.report_exception(cause);
        }
    }
}

struct Engine {
    factories: HashMap<ServerId, Arc<dyn ConnectionFactoryDelegate>>,
    map: FailoverMap,
    failures: mpsc::UnboundedSender<FailureEvent>,
    events: broadcast::Sender<FailoverEvent>,
}

impl Engine {
    fn watch(&self, connection: &ClientConnection) {
        connection.add_failure_listener(Arc::new(FailoverListener {
            connection: connection.downgrade(),
            failures: self.failures.clone(),
        }));
    }

    fn publish(&self, event: FailoverEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn fail_over(&self, connection: &ClientConnection, cause: &Error) -> Result<FailoverOutcome> {
        let previous = connection.connection_id();
        let failed = connection.server_id();
        info!(connection = %previous, %failed, %cause, "Connection failed, starting failover");

        let delegate = match self.reconnect(connection, failed).await {
            Ok(Some(delegate)) => delegate,
            Ok(None) => {
                warn!(connection = %previous, %failed, "No server took over, keeping connection");
                connection.set_failover_state(FailoverState::Connected);
                connection.report_exception(cause);
                self.publish(FailoverEvent::Abandoned { connection_id: previous });
                return Ok(FailoverOutcome::NoFailover);
            },
            Err(err) => {
                error!(connection = %previous, %failed, %err, "Failover could not reconnect");
                self.give_up(connection, previous, &err);
                return Err(err);
            },
        };

        connection.set_failover_state(FailoverState::ReplayingState);
        if let Err(err) = self.replay(connection, delegate).await {
            error!(connection = %previous, %err, "Failover replay failed");
            self.give_up(connection, previous, &err);
            return Err(err);
        }
        connection.set_failover_state(FailoverState::Connected);

        let server_id = connection.server_id();
        let connection_id = connection.connection_id();
        info!(previous = %previous, connection = %connection_id, %server_id, "Failover complete");
        self.publish(FailoverEvent::Completed { previous, connection_id, server_id });
        Ok(FailoverOutcome::FailedOver { server_id })
    }

    fn give_up(&self, connection: &ClientConnection, connection_id: ConnectionId, err: &Error) {
        connection.set_failover_state(FailoverState::Failed);
        connection.report_exception(err);
        self.publish(FailoverEvent::Failed { connection_id, reason: err.to_string() });
    }

    /// Connect to the backup of `failed`, following redirects. `None` when
    /// a server reports that no failover happened.
    async fn reconnect(
        &self,
        connection: &ClientConnection,
        failed: ServerId,
    ) -> Result<Option<Arc<dyn ConnectionDelegate>>> {
        let mut target = self
            .map
            .failover_for(failed)
            .ok_or_else(|| Error::failover_exceeded(format!("no failover server configured for server {failed}")))?;
        let state = connection.state();

        for hop in 1..=MAX_RECONNECT_HOP_COUNT {
            connection.set_failover_state(FailoverState::Reconnecting { hop });
            let factory = self
                .factories
                .get(&target)
                .ok_or_else(|| Error::failover_exceeded(format!("no connection factory for server {target}")))?;
            debug!(hop, %target, %failed, "Trying failover server");
            let result = factory
                .create_connection_delegate(state.username.as_deref(), state.password.as_deref(), Some(failed))
                .await?;
            if let Some(delegate) = result.delegate {
                return Ok(Some(delegate));
            }
            match result.actual_failover_node {
                Some(next) => {
                    debug!(hop, from = %target, to = %next, "Redirected to the server that took over");
                    target = next;
                },
                None => return Ok(None),
            }
        }
        Err(Error::failover_exceeded(format!(
            "no server accepted the failover of server {failed} within {MAX_RECONNECT_HOP_COUNT} attempts"
        )))
    }

    async fn replay(&self, connection: &ClientConnection, delegate: Arc<dyn ConnectionDelegate>) -> Result<()> {
        let state = connection.state();
        if let Some(client_id) = &state.client_id {
            delegate.set_client_id(client_id).await?;
        }
        connection.replace_delegate(Arc::clone(&delegate));
        self.watch(connection);

        for session in connection.sessions() {
            self.replay_session(connection, delegate.as_ref(), &session).await?;
        }
        if state.started {
            delegate.start().await?;
        }
        Ok(())
    }

    async fn replay_session(
        &self,
        connection: &ClientConnection,
        delegate: &dyn ConnectionDelegate,
        session: &ClientSession,
    ) -> Result<()> {
        let interceptor = session.interceptor();
        let state = interceptor.state();
        let old_session = state.session_id;
        let server_session = delegate.create_session_delegate(state.transacted, state.ack_mode, state.xa).await?;
        interceptor.replace_delegate(Arc::clone(&server_session));

        let producers = session.producers();
        let created =
            try_join_all(producers.iter().map(|p| server_session.create_producer_delegate(p.destination()))).await?;
        for (producer, new) in producers.iter().zip(created) {
            producer.replace_delegate(new);
        }

        let callbacks = connection.callbacks();
        let mut consumers = HashSet::new();
        for consumer in session.consumers() {
            let new = interceptor.create_consumer_delegate(consumer.spec()).await?;
            let new_id = new.consumer_id();
            let old_id = consumer.replace_delegate(new);
            if state.transacted || state.xa {
                connection.resource_manager().handle_failover(old_id, new_id);
            }
            interceptor.remap_consumer(old_id, new_id);

            let handler = callbacks.unregister_handler(old_id).unwrap_or_else(|| Arc::clone(consumer.handler()));
            let dropped = handler.copy_state_from(&MessageCallbackHandler::new(new_id));
            callbacks.register_handler(handler);
            debug!(old = %old_id, new = %new_id, dropped, "Recreated consumer");
            consumers.insert(new_id);
        }

        let browsers = session.browsers();
        let created = try_join_all(browsers.iter().map(|b| {
            let browser = b.state();
            server_session.create_browser_delegate(browser.destination, browser.selector)
        }))
        .await?;
        for (browser, new) in browsers.iter().zip(created) {
            browser.replace_delegate(new);
        }

        let acks = interceptor.failover_ack_infos(&consumers);
        if !acks.is_empty() {
            info!(session = %interceptor.session_id(), count = acks.len(), "Restoring unacknowledged deliveries");
            interceptor.send_unacked_ack_infos(acks).await?;
        }
        debug!(
            old = %old_session,
            new = %interceptor.session_id(),
            producers = producers.len(),
            consumers = consumers.len(),
            browsers = browsers.len(),
            "Recreated session"
        );
        Ok(())
    }
}

async fn run(engine: Arc<Engine>, mut failures: mpsc::UnboundedReceiver<FailureEvent>) {
    while let Some(FailureEvent { connection, cause }) = failures.recv().await {
        let Some(connection) = connection.upgrade() else {
            continue;
        };
        if let Err(err) = engine.fail_over(&connection, &cause).await {
            debug!(%err, "Failover finished with an error");
        }
    }
}

/// Moves watched connections to their backup server when the transport fails.
///
/// Dropping the coordinator stops its worker; connections it watched then
/// fail for good on their next fault.
pub struct FailoverCoordinator {
    engine: Arc<Engine>,
    worker: JoinHandle<()>,
}

impl FailoverCoordinator {
    /// Coordinator over the connection factories of every cluster node.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when called outside a tokio runtime.
    pub fn new(factories: &[Arc<dyn ConnectionFactoryDelegate>], map: FailoverMap) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::Configuration { message: format!("failover needs a tokio runtime: {err}") })?;
        let (failures, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let factories = factories.iter().map(|f| (f.server_id(), Arc::clone(f))).collect();
        let engine = Arc::new(Engine { factories, map, failures, events });
        let worker = runtime.spawn(run(Arc::clone(&engine), receiver));
        Ok(Self { engine, worker })
    }

    /// The failover assignments in use.
    #[must_use]
    pub fn failover_map(&self) -> &FailoverMap {
        &self.engine.map
    }

    /// Fail `connection` over automatically when its transport fails.
    pub fn watch(&self, connection: &ClientConnection) {
        self.engine.watch(connection);
        debug!(connection = %connection.connection_id(), "Watching connection for failover");
    }

    /// Notifications about failovers of watched connections.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.engine.events.subscribe()
    }

    /// Fail `connection` over now, as if its transport had failed with `cause`.
    ///
    /// # Errors
    /// Returns [`Error::FailoverExceeded`] when no backup is configured or
    /// no server accepted the connection within [`MAX_RECONNECT_HOP_COUNT`]
    /// attempts, or the error that broke reconnecting or restoring state. The
    /// connection is left in [`FailoverState::Failed`] in every error case.
    pub async fn handle_failure(&self, connection: &ClientConnection, cause: &Error) -> Result<FailoverOutcome> {
        if !connection.begin_failover() {
            return Ok(FailoverOutcome::AlreadyInProgress);
        }
        self.engine.fail_over(connection, cause).await
    }
}

impl Drop for FailoverCoordinator {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("servers", &self.engine.factories.len())
            .field("map", &self.engine.map)
            .finish()
    }
}
