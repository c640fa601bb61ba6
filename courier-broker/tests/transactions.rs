//! Server transactions: atomicity, two-phase commit and in-doubt recovery
//! across a storage restart.

use bytes::Bytes;
use courier_broker::{BrokerConfig, ClusterView, Delivery, Offer, Receiver, ServerPeer, TransactionState};
use courier_core::{types::ConsumerId, Destination, Message, Xid};
use courier_storage::MemoryEnvironment;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Sink {
    received: Mutex<Vec<Delivery>>,
}

impl Sink {
    fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl Receiver for Sink {
    fn receiver_id(&self) -> ConsumerId {
        ConsumerId::new(42)
    }

    fn offer(&self, delivery: &Delivery) -> Offer {
        self.received.lock().push(delivery.clone());
        Offer::Accepted
    }
}

fn node(env: &MemoryEnvironment) -> ServerPeer {
    let peer = ServerPeer::new(&BrokerConfig::default(), Arc::new(env.clone()), ClusterView::new()).unwrap();
    peer.destinations().create_queue("orders").unwrap();
    peer.start().unwrap();
    peer
}

fn persistent(body: &str) -> Message {
    Message::builder(Destination::queue("orders").unwrap())
        .payload(Bytes::from(body.to_string()))
        .persistent(true)
        .build()
        .unwrap()
}

fn bodies(deliveries: &[Delivery]) -> Vec<String> {
    deliveries.iter().map(|d| String::from_utf8(d.message().payload.to_vec()).unwrap()).collect()
}

fn xid(branch: &[u8]) -> Xid {
    Xid::new(7, b"global".to_vec(), branch.to_vec())
}

#[test]
fn test_local_transaction_is_all_or_nothing() {
    let env = MemoryEnvironment::new();
    let peer = node(&env);
    let queue = peer.destinations().queue("orders").unwrap();
    for body in ["a", "b", "c"] {
        peer.destinations().route(persistent(body), None).unwrap();
    }
    let sink = Arc::new(Sink::default());
    queue.add_receiver(sink.clone()).unwrap();
    let delivered = sink.take();
    assert_eq!(bodies(&delivered), vec!["a", "b", "c"]);

    let tx = peer.transactions().create_transaction();
    peer.destinations().route(persistent("d"), Some(&tx)).unwrap();
    peer.destinations().route(persistent("e"), Some(&tx)).unwrap();
    delivered[0].acknowledge(Some(&tx)).unwrap();
    delivered[1].acknowledge(Some(&tx)).unwrap();
    assert_eq!(tx.operation_count(), 4);
    assert_eq!(queue.message_count(), 3);
    assert!(sink.take().is_empty());

    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(queue.message_count(), 3);
    assert_eq!(queue.delivering_count(), 3);
    assert!(sink.take().is_empty());
    assert!(tx.commit().unwrap_err().is_illegal_state());

    let tx = peer.transactions().create_transaction();
    peer.destinations().route(persistent("d"), Some(&tx)).unwrap();
    peer.destinations().route(persistent("e"), Some(&tx)).unwrap();
    delivered[0].acknowledge(Some(&tx)).unwrap();
    delivered[1].acknowledge(Some(&tx)).unwrap();
    tx.commit().unwrap();

    assert!(delivered[0].is_done());
    assert!(delivered[1].is_done());
    assert!(!delivered[2].is_done());
    assert_eq!(bodies(&sink.take()), vec!["d", "e"]);
    assert_eq!(queue.message_count(), 3);
}

#[test]
fn test_failed_commit_rolls_back() {
    let env = MemoryEnvironment::new();
    let peer = node(&env);
    let queue = peer.destinations().queue("orders").unwrap();

    let tx = peer.transactions().create_transaction();
    peer.destinations().route(persistent("a"), Some(&tx)).unwrap();
    env.fail_writes(true);
    assert!(tx.commit().unwrap_err().is_storage());
    env.fail_writes(false);

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(queue.message_count(), 0);
}

#[test]
fn test_prepared_branch_commits_once_after_restart() {
    let env = MemoryEnvironment::new();
    let first = node(&env);
    for body in ["a", "b"] {
        first.destinations().route(persistent(body), None).unwrap();
    }
    let sink = Arc::new(Sink::default());
    first.destinations().queue("orders").unwrap().add_receiver(sink.clone()).unwrap();
    let delivered = sink.take();

    let branch = xid(b"commit");
    let tx = first.transactions().create_xa_transaction(branch.clone()).unwrap();
    first.destinations().route(persistent("c"), Some(&tx)).unwrap();
    delivered[0].acknowledge(Some(&tx)).unwrap();
    first.transactions().prepare(&branch).unwrap();
    assert_eq!(tx.state(), TransactionState::Prepared);

    env.restart().unwrap();
    let second = node(&env);
    assert_eq!(second.transactions().in_doubt_xids(), vec![branch.clone()]);
    let queue = second.destinations().queue("orders").unwrap();
    assert_eq!(queue.message_count(), 2);
    assert_eq!(queue.delivering_count(), 1);

    second.transactions().commit(&branch).unwrap();
    assert!(second.transactions().in_doubt_xids().is_empty());
    assert!(second.transactions().commit(&branch).unwrap_err().is_illegal_state());

    let sink = Arc::new(Sink::default());
    queue.add_receiver(sink.clone()).unwrap();
    assert_eq!(bodies(&sink.take()), vec!["b", "c"]);

    env.restart().unwrap();
    let third = node(&env);
    assert!(third.transactions().in_doubt_xids().is_empty());
    assert_eq!(third.destinations().queue("orders").unwrap().message_count(), 2);
}

#[test]
fn test_prepared_branch_rolls_back_after_restart() {
    let env = MemoryEnvironment::new();
    let first = node(&env);
    for body in ["a", "b"] {
        first.destinations().route(persistent(body), None).unwrap();
    }
    let sink = Arc::new(Sink::default());
    first.destinations().queue("orders").unwrap().add_receiver(sink.clone()).unwrap();
    let delivered = sink.take();

    let branch = xid(b"rollback");
    let tx = first.transactions().create_xa_transaction(branch.clone()).unwrap();
    first.destinations().route(persistent("c"), Some(&tx)).unwrap();
    delivered[0].acknowledge(Some(&tx)).unwrap();
    tx.prepare().unwrap();

    env.restart().unwrap();
    let second = node(&env);
    second.transactions().rollback(&branch).unwrap();
    assert!(second.transactions().rollback(&branch).unwrap_err().is_illegal_state());

    let queue = second.destinations().queue("orders").unwrap();
    let sink = Arc::new(Sink::default());
    queue.add_receiver(sink.clone()).unwrap();
    assert_eq!(bodies(&sink.take()), vec!["a", "b"]);

    env.restart().unwrap();
    let third = node(&env);
    assert!(third.transactions().in_doubt_xids().is_empty());
    assert_eq!(third.destinations().queue("orders").unwrap().message_count(), 2);
}

#[test]
fn test_out_of_order_xa_calls_are_rejected() {
    let env = MemoryEnvironment::new();
    let peer = node(&env);
    let transactions = peer.transactions();
    let branch = xid(b"order");

    assert!(transactions.commit(&branch).unwrap_err().is_illegal_state());
    assert!(transactions.prepare(&branch).unwrap_err().is_illegal_state());

    transactions.create_xa_transaction(branch.clone()).unwrap();
    assert!(transactions.create_xa_transaction(branch.clone()).unwrap_err().is_illegal_state());
    assert!(transactions.commit(&branch).unwrap_err().is_illegal_state());

    transactions.prepare(&branch).unwrap();
    assert!(transactions.prepare(&branch).unwrap_err().is_illegal_state());
    transactions.commit(&branch).unwrap();
    assert!(transactions.is_empty());

    let local = transactions.create_transaction();
    assert!(local.prepare().unwrap_err().is_illegal_state());
}
