//! Client sessions against an in-VM broker: acknowledgement modes, local
//! transactions and XA branches.

use anyhow::Result;
use bytes::Bytes;
use courier_broker::{Broker, BrokerConfig, Channel};
use courier_client::{ClientConnection, ClientConsumer, ClientSession};
use courier_core::{config::ClientConfig, AckMode, Destination, Message, Xid};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(1);
const NOTHING: Duration = Duration::from_millis(50);

async fn broker() -> Result<(Broker, Channel)> {
    let broker = Broker::new(BrokerConfig::default())?;
    let queue = broker.create_queue("orders")?;
    broker.create_topic("news")?;
    broker.start().await?;
    Ok((broker, queue))
}

async fn connect(broker: &Broker) -> Result<ClientConnection> {
    let factory = broker.connection_factory();
    Ok(ClientConnection::connect(&factory, Some("guest"), None, ClientConfig::default()).await?)
}

fn orders() -> Destination {
    Destination::queue("orders").unwrap()
}

async fn send_all(session: &ClientSession, bodies: &[&str]) -> Result<()> {
    let producer = session.create_producer(orders()).await?;
    for body in bodies {
        producer.send(Message::new(orders(), Bytes::from(body.to_string()))).await?;
    }
    Ok(())
}

async fn receive_body(consumer: &ClientConsumer) -> Result<Option<String>> {
    let message = consumer.receive(Some(WAIT)).await?;
    Ok(message.map(|m| String::from_utf8_lossy(&m.payload).into_owned()))
}

async fn receive_bodies(consumer: &ClientConsumer, n: usize) -> Result<Vec<String>> {
    let mut bodies = Vec::with_capacity(n);
    for _ in 0..n {
        bodies.push(receive_body(consumer).await?.expect("message expected"));
    }
    Ok(bodies)
}

#[tokio::test]
async fn test_auto_acknowledge_acks_on_receive() -> Result<()> {
    let (broker, queue) = broker().await?;
    let connection = connect(&broker).await?;
    let session = connection.create_session(false, AckMode::AutoAcknowledge).await?;
    let consumer = session.create_consumer(orders(), None).await?;
    send_all(&session, &["a"]).await?;
    assert!(consumer.receive(Some(NOTHING)).await?.is_none());

    connection.start().await?;
    assert_eq!(receive_body(&consumer).await?.as_deref(), Some("a"));
    assert_eq!(queue.message_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_client_acknowledge_recover_redelivers_in_order() -> Result<()> {
    let (broker, queue) = broker().await?;
    let connection = connect(&broker).await?;
    let session = connection.create_session(false, AckMode::ClientAcknowledge).await?;
    let consumer = session.create_consumer(orders(), None).await?;
    send_all(&session, &["a", "b", "c"]).await?;
    connection.start().await?;

    assert_eq!(receive_bodies(&consumer, 3).await?, vec!["a", "b", "c"]);
    assert_eq!(session.state().unacked.len(), 3);

    session.recover()?;
    assert_eq!(queue.message_count(), 3);
    assert_eq!(receive_bodies(&consumer, 3).await?, vec!["a", "b", "c"]);
    assert!(consumer.receive(Some(NOTHING)).await?.is_none());

    session.acknowledge().await?;
    assert_eq!(queue.message_count(), 0);
    assert!(session.state().unacked.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_closing_consumer_returns_unacked_messages() -> Result<()> {
    let (broker, queue) = broker().await?;
    let connection = connect(&broker).await?;
    connection.start().await?;
    let session = connection.create_session(false, AckMode::ClientAcknowledge).await?;
    send_all(&session, &["a"]).await?;

    let first = session.create_consumer(orders(), None).await?;
    assert_eq!(receive_body(&first).await?.as_deref(), Some("a"));
    first.close().await?;
    assert!(first.receive(Some(NOTHING)).await.unwrap_err().is_illegal_state());
    assert!(session.state().unacked.is_empty());

    let second = session.create_consumer(orders(), None).await?;
    assert_eq!(receive_body(&second).await?.as_deref(), Some("a"));
    session.acknowledge().await?;
    assert_eq!(queue.message_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_transacted_session_commits_and_rolls_back() -> Result<()> {
    let (broker, queue) = broker().await?;
    let connection = connect(&broker).await?;
    connection.start().await?;
    let session = connection.create_session(true, AckMode::AutoAcknowledge).await?;
    assert!(session.recover().unwrap_err().is_illegal_state());

    send_all(&session, &["x", "y"]).await?;
    assert_eq!(queue.message_count(), 0);
    session.commit().await?;
    assert_eq!(queue.message_count(), 2);

    let consumer = session.create_consumer(orders(), None).await?;
    assert_eq!(receive_bodies(&consumer, 2).await?, vec!["x", "y"]);
    session.rollback()?;
    assert_eq!(queue.message_count(), 2);

    assert_eq!(receive_bodies(&consumer, 2).await?, vec!["x", "y"]);
    session.commit().await?;
    assert_eq!(queue.message_count(), 0);
    assert!(consumer.receive(Some(NOTHING)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_non_transacted_session_cannot_commit() -> Result<()> {
    let (broker, _queue) = broker().await?;
    let connection = connect(&broker).await?;
    let session = connection.create_session(false, AckMode::DupsOkAcknowledge).await?;
    assert!(session.commit().await.unwrap_err().is_illegal_state());
    assert!(session.rollback().unwrap_err().is_illegal_state());
    assert!(session.xa_resource().unwrap_err().is_illegal_state());
    Ok(())
}

#[tokio::test]
async fn test_xa_branches_stage_work_until_completion() -> Result<()> {
    let (broker, queue) = broker().await?;
    let connection = connect(&broker).await?;
    connection.start().await?;
    let session = connection.create_xa_session().await?;
    let xa = session.xa_resource()?;
    let consumer = session.create_consumer(orders(), None).await?;

    let produce = Xid::new(1, b"gtx".to_vec(), b"produce".to_vec());
    xa.start(&produce)?;
    send_all(&session, &["x"]).await?;
    xa.end(&produce, false)?;
    xa.prepare(&produce).await?;
    assert_eq!(xa.recover().await?, vec![produce.clone()]);
    assert_eq!(queue.message_count(), 0);
    xa.commit(&produce, false).await?;
    assert!(xa.commit(&produce, false).await.unwrap_err().is_illegal_state());

    let aborted = Xid::new(1, b"gtx".to_vec(), b"aborted".to_vec());
    xa.start(&aborted)?;
    assert_eq!(receive_body(&consumer).await?.as_deref(), Some("x"));
    xa.end(&aborted, false)?;
    xa.rollback(&aborted).await?;
    assert_eq!(queue.message_count(), 1);

    let consume = Xid::new(1, b"gtx".to_vec(), b"consume".to_vec());
    xa.start(&consume)?;
    assert_eq!(receive_body(&consumer).await?.as_deref(), Some("x"));
    xa.end(&consume, false)?;
    xa.commit(&consume, true).await?;
    assert_eq!(queue.message_count(), 0);
    assert!(connection.resource_manager().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_durable_subscriber_lifecycle() -> Result<()> {
    let (broker, _queue) = broker().await?;
    let news = Destination::topic("news")?;

    let anonymous = connect(&broker).await?;
    let session = anonymous.create_session(false, AckMode::AutoAcknowledge).await?;
    let err = session.create_durable_subscriber(news.clone(), "daily", None, false).await.unwrap_err();
    assert!(err.is_illegal_state());

    let connection = connect(&broker).await?;
    connection.set_client_id("reader").await?;
    assert_eq!(connection.client_id().as_deref(), Some("reader"));
    connection.start().await?;
    let session = connection.create_session(false, AckMode::AutoAcknowledge).await?;
    let subscriber = session.create_durable_subscriber(news.clone(), "daily", None, false).await?;
    assert!(subscriber.state().is_durable());
    assert!(session.unsubscribe("daily").await.unwrap_err().is_illegal_state());

    subscriber.close().await?;
    session.unsubscribe("daily").await?;
    connection.close().await?;
    assert!(connection.create_session(false, AckMode::AutoAcknowledge).await.unwrap_err().is_illegal_state());
    Ok(())
}
