//! Client failover between in-VM broker nodes: redirect chains, abandoned
//! failovers and the state a connection carries over to the new server.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::{Broker, BrokerConfig, Channel, ClusterView, ServerPeer};
use courier_client::{ClientConnection, ClientConsumer, ExceptionListener, FailoverState};
use courier_cluster::{
    ClusteredConnectionFactory, FailoverCoordinator, FailoverEvent, FailoverMap, FailoverOutcome,
};
use courier_core::{
    config::ClientConfig,
    delegate::{ConnectionFactoryDelegate, CreateConnectionResult},
    AckMode, Destination, Error, Message, ServerId,
};
use courier_storage::MemoryEnvironment;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

const WAIT: Duration = Duration::from_secs(1);
const FAILED: ServerId = ServerId::new(1);

/// Node that always points the client somewhere else.
struct Redirect {
    id: ServerId,
    next: ServerId,
}

#[async_trait]
impl ConnectionFactoryDelegate for Redirect {
    fn server_id(&self) -> ServerId {
        self.id
    }

    async fn create_connection_delegate(
        &self,
        _username: Option<&str>,
        _password: Option<&str>,
        _failed_server_id: Option<ServerId>,
    ) -> courier_core::Result<CreateConnectionResult> {
        Ok(CreateConnectionResult::redirect(self.next))
    }
}

/// Node that knows of no failover.
struct Unaware(ServerId);

#[async_trait]
impl ConnectionFactoryDelegate for Unaware {
    fn server_id(&self) -> ServerId {
        self.0
    }

    async fn create_connection_delegate(
        &self,
        _username: Option<&str>,
        _password: Option<&str>,
        _failed_server_id: Option<ServerId>,
    ) -> courier_core::Result<CreateConnectionResult> {
        Ok(CreateConnectionResult::no_failover())
    }
}

#[derive(Default)]
struct Exceptions(Mutex<Vec<Error>>);

impl ExceptionListener for Exceptions {
    fn on_exception(&self, error: &Error) {
        self.0.lock().push(error.clone());
    }
}

fn orders() -> Destination {
    Destination::queue("orders").unwrap()
}

fn message(body: &str, persistent: bool) -> Result<Message> {
    Ok(Message::builder(orders()).payload(Bytes::from(body.to_string())).persistent(persistent).build()?)
}

async fn receive_body(consumer: &ClientConsumer) -> Result<String> {
    let message = consumer.receive(Some(WAIT)).await?.expect("message expected");
    Ok(String::from_utf8_lossy(&message.payload).into_owned())
}

async fn started_broker(id: u32) -> Result<Broker> {
    let broker = Broker::new(BrokerConfig::default().with_server_id(id))?;
    broker.create_queue("orders")?;
    broker.start().await?;
    Ok(broker)
}

async fn connect(broker: &Broker) -> Result<ClientConnection> {
    let factory = broker.connection_factory();
    Ok(ClientConnection::connect(&factory, Some("guest"), None, ClientConfig::default()).await?)
}

/// `length` nodes from 100 upwards, each redirecting to the next; the last
/// one is a live broker that took over the failed server.
async fn redirect_chain(length: u32) -> Result<(Broker, Vec<Arc<dyn ConnectionFactoryDelegate>>)> {
    let last = 100 + length - 1;
    let backup = started_broker(last).await?;
    backup.peer().take_over(FAILED);
    let mut factories: Vec<Arc<dyn ConnectionFactoryDelegate>> = (100..last)
        .map(|id| Arc::new(Redirect { id: ServerId::new(id), next: ServerId::new(id + 1) }) as _)
        .collect();
    factories.push(Arc::new(backup.connection_factory()));
    Ok((backup, factories))
}

#[tokio::test]
async fn test_redirect_chain_within_hop_bound_connects() -> Result<()> {
    let primary = started_broker(1).await?;
    let connection = connect(&primary).await?;
    let (_backup, factories) = redirect_chain(10).await?;
    let coordinator = FailoverCoordinator::new(&factories, FailoverMap::new().with(FAILED, ServerId::new(100)))?;

    let outcome = coordinator.handle_failure(&connection, &Error::connection_fault("link down")).await?;
    assert_eq!(outcome, FailoverOutcome::FailedOver { server_id: ServerId::new(109) });
    assert_eq!(connection.server_id(), ServerId::new(109));
    assert_eq!(connection.failover_state(), FailoverState::Connected);
    connection.start().await?;
    Ok(())
}

#[tokio::test]
async fn test_redirect_chain_beyond_hop_bound_fails() -> Result<()> {
    let primary = started_broker(1).await?;
    let connection = connect(&primary).await?;
    let exceptions = Arc::new(Exceptions::default());
    connection.set_exception_listener(Arc::clone(&exceptions) as _);
    let (_backup, factories) = redirect_chain(11).await?;
    let coordinator = FailoverCoordinator::new(&factories, FailoverMap::new().with(FAILED, ServerId::new(100)))?;

    let err = coordinator.handle_failure(&connection, &Error::connection_fault("link down")).await.unwrap_err();
    assert!(matches!(err, Error::FailoverExceeded { .. }));
    assert_eq!(connection.failover_state(), FailoverState::Failed);
    assert_eq!(connection.server_id(), FAILED);
    assert_eq!(exceptions.0.lock().as_slice(), &[err]);

    let again = coordinator.handle_failure(&connection, &Error::connection_fault("link down")).await?;
    assert_eq!(again, FailoverOutcome::AlreadyInProgress);
    let refused = connection.create_session(false, AckMode::AutoAcknowledge).await.unwrap_err();
    assert!(matches!(refused, Error::ConnectionFault { .. }));
    Ok(())
}

#[tokio::test]
async fn test_no_failover_reports_original_fault() -> Result<()> {
    let primary = started_broker(1).await?;
    let connection = connect(&primary).await?;
    let exceptions = Arc::new(Exceptions::default());
    connection.set_exception_listener(Arc::clone(&exceptions) as _);
    let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> = vec![Arc::new(Unaware(ServerId::new(2)))];
    let coordinator = FailoverCoordinator::new(&factories, FailoverMap::ring(&[FAILED, ServerId::new(2)]))?;

    let cause = Error::connection_fault("socket reset");
    let outcome = coordinator.handle_failure(&connection, &cause).await?;
    assert_eq!(outcome, FailoverOutcome::NoFailover);
    assert_eq!(connection.failover_state(), FailoverState::Connected);
    assert_eq!(connection.server_id(), FAILED);
    assert_eq!(exceptions.0.lock().as_slice(), &[cause]);
    connection.start().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_failover_target_fails() -> Result<()> {
    let primary = started_broker(1).await?;
    let cause = Error::connection_fault("link down");

    let unmapped = connect(&primary).await?;
    let coordinator = FailoverCoordinator::new(&[], FailoverMap::new())?;
    let err = coordinator.handle_failure(&unmapped, &cause).await.unwrap_err();
    assert!(matches!(err, Error::FailoverExceeded { .. }));

    let redirected = connect(&primary).await?;
    let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> =
        vec![Arc::new(Redirect { id: ServerId::new(2), next: ServerId::new(77) })];
    let coordinator = FailoverCoordinator::new(&factories, FailoverMap::new().with(FAILED, ServerId::new(2)))?;
    let err = coordinator.handle_failure(&redirected, &cause).await.unwrap_err();
    assert!(matches!(err, Error::FailoverExceeded { .. }));
    assert_eq!(redirected.failover_state(), FailoverState::Failed);
    Ok(())
}

/// Two nodes over one store, the second standing by for the first.
struct SharedStore {
    env: MemoryEnvironment,
    view: ClusterView,
    primary: ServerPeer,
}

impl SharedStore {
    fn new() -> Result<Self> {
        let env = MemoryEnvironment::new();
        let view = ClusterView::new();
        let config = BrokerConfig::default().with_server_id(1);
        let primary = ServerPeer::new(&config, Arc::new(env.clone()), view.clone())?;
        primary.destinations().create_queue("orders")?;
        primary.destinations().create_topic("news")?;
        primary.start()?;
        Ok(Self { env, view, primary })
    }

    fn backup(&self) -> Result<ServerPeer> {
        let config = BrokerConfig::default().with_server_id(2);
        let backup = ServerPeer::new(&config, Arc::new(self.env.clone()), self.view.clone())?;
        backup.start()?;
        Ok(backup)
    }

    /// Deploy the failed node's destinations on `backup`, recovering their
    /// stored messages, and record the takeover.
    fn take_over(backup: &ServerPeer) -> Result<Channel> {
        let queue = backup.destinations().create_queue("orders")?;
        backup.destinations().create_topic("news")?;
        backup.take_over(FAILED);
        Ok(queue)
    }
}

#[tokio::test]
async fn test_failover_restores_endpoints_and_persistent_deliveries() -> Result<()> {
    let cluster = SharedStore::new()?;
    let connection = ClientConnection::connect(
        &cluster.primary.connection_factory(),
        Some("guest"),
        None,
        ClientConfig::default(),
    )
    .await?;
    let exceptions = Arc::new(Exceptions::default());
    connection.set_exception_listener(Arc::clone(&exceptions) as _);
    connection.set_client_id("reader").await?;

    let session = connection.create_session(false, AckMode::ClientAcknowledge).await?;
    let producer = session.create_producer(orders()).await?;
    let consumer = session.create_consumer(orders(), None).await?;
    let subscriber =
        session.create_durable_subscriber(Destination::topic("news")?, "sub", Some("kind = 'alert'"), false).await?;
    let browser = session.create_browser(orders(), None).await?;

    for i in 0..5 {
        producer.send(message(&format!("p{i}"), true)?).await?;
        producer.send(message(&format!("t{i}"), false)?).await?;
    }
    connection.start().await?;
    for _ in 0..10 {
        receive_body(&consumer).await?;
    }
    assert_eq!(session.state().unacked.len(), 10);

    let specs_before: Vec<_> = session.consumers().iter().map(ClientConsumer::spec).collect();
    let ids_before = (consumer.id(), subscriber.id(), browser.id(), producer.id());
    let browser_before = browser.state();

    cluster.primary.crash();
    let backup = cluster.backup()?;
    let queue = SharedStore::take_over(&backup)?;
    assert_eq!(queue.message_count(), 5);

    let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> = vec![Arc::new(backup.connection_factory())];
    let coordinator = FailoverCoordinator::new(&factories, FailoverMap::ring(&[FAILED, ServerId::new(2)]))?;
    let outcome = coordinator.handle_failure(&connection, &Error::connection_fault("server 1 crashed")).await?;
    assert_eq!(outcome, FailoverOutcome::FailedOver { server_id: ServerId::new(2) });

    assert_eq!(connection.server_id(), ServerId::new(2));
    assert_eq!(connection.client_id().as_deref(), Some("reader"));
    assert!(connection.is_started());
    assert!(exceptions.0.lock().is_empty());

    let specs_after: Vec<_> = session.consumers().iter().map(ClientConsumer::spec).collect();
    assert_eq!(specs_after, specs_before);
    assert_ne!(consumer.id(), ids_before.0);
    assert_ne!(subscriber.id(), ids_before.1);
    assert_ne!(browser.id(), ids_before.2);
    assert_ne!(producer.id(), ids_before.3);
    let browser_after = browser.state();
    assert_eq!(browser_after.destination, browser_before.destination);
    assert_eq!(browser_after.selector, browser_before.selector);

    let unacked = session.state().unacked;
    assert_eq!(unacked.len(), 5);
    assert!(unacked.iter().all(|d| d.message.persistent && d.consumer_id == consumer.id()));
    assert_eq!(queue.delivering_count(), 5);
    assert_eq!(queue.message_count(), 5);

    producer.send(message("after", true)?).await?;
    assert_eq!(receive_body(&consumer).await?, "after");
    session.acknowledge().await?;
    assert_eq!(queue.message_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_watched_connection_fails_over_on_crash() -> Result<()> {
    let cluster = SharedStore::new()?;
    let backup = cluster.backup()?;
    let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> =
        vec![Arc::new(cluster.primary.connection_factory()), Arc::new(backup.connection_factory())];
    let factory =
        ClusteredConnectionFactory::new(factories, FailoverMap::ring(&[FAILED, ServerId::new(2)]), ClientConfig::default())?;
    let mut events = factory.coordinator().subscribe();

    let connection = factory.create_connection(None, None).await?;
    assert_eq!(connection.server_id(), FAILED);
    let session = connection.create_session(false, AckMode::ClientAcknowledge).await?;
    let consumer = session.create_consumer(orders(), None).await?;
    let producer = session.create_producer(orders()).await?;
    producer.send(message("kept", true)?).await?;
    producer.send(message("lost", false)?).await?;
    connection.start().await?;
    assert_eq!(receive_body(&consumer).await?, "kept");
    assert_eq!(receive_body(&consumer).await?, "lost");
    let previous = connection.connection_id();

    cluster.primary.crash();
    assert_eq!(connection.failover_state(), FailoverState::SelectingTarget);
    let queue = SharedStore::take_over(&backup)?;

    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(
        event,
        FailoverEvent::Completed { previous, connection_id: connection.connection_id(), server_id: ServerId::new(2) }
    );
    assert_eq!(connection.failover_state(), FailoverState::Connected);
    assert_eq!(queue.delivering_count(), 1);
    session.acknowledge().await?;
    assert_eq!(queue.message_count(), 0);
    assert!(consumer.receive(Some(Duration::from_millis(50))).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_clustered_factory_round_robin() -> Result<()> {
    let first = started_broker(1).await?;
    let second = started_broker(2).await?;
    let factories: Vec<Arc<dyn ConnectionFactoryDelegate>> =
        vec![Arc::new(first.connection_factory()), Arc::new(second.connection_factory())];
    let factory = ClusteredConnectionFactory::new(factories, FailoverMap::new(), ClientConfig::default())?;
    assert_eq!(factory.server_count(), 2);

    let mut servers = Vec::new();
    for _ in 0..4 {
        servers.push(factory.create_connection(None, None).await?.server_id().value());
    }
    assert_eq!(servers, vec![1, 2, 1, 2]);

    let empty = ClusteredConnectionFactory::new(Vec::new(), FailoverMap::new(), ClientConfig::default());
    assert!(matches!(empty.unwrap_err(), Error::Configuration { .. }));
    Ok(())
}
