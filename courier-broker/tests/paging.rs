//! Paging behaviour of a single channel seen from the outside.

use bytes::Bytes;
use courier_broker::{Channel, ChannelConfig, Delivery, MessageStore, Offer, Receiver};
use courier_core::{types::ChannelId, types::ConsumerId, Destination, Message, PagingConfig};
use courier_storage::{MemoryEnvironment, PersistenceManager};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

/// Accepts everything while open and remembers what it got.
struct Sink {
    open: Mutex<bool>,
    received: Mutex<Vec<Delivery>>,
}

impl Sink {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self { open: Mutex::new(open), received: Mutex::new(Vec::new()) })
    }

    fn set_open(&self, open: bool) {
        *self.open.lock() = open;
    }

    fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl Receiver for Sink {
    fn receiver_id(&self) -> ConsumerId {
        ConsumerId::new(7)
    }

    fn offer(&self, delivery: &Delivery) -> Offer {
        if !*self.open.lock() {
            return Offer::Busy;
        }
        self.received.lock().push(delivery.clone());
        Offer::Accepted
    }
}

fn channel(paging: PagingConfig) -> (Channel, MessageStore, PersistenceManager) {
    let store = MessageStore::new();
    let pm = PersistenceManager::new(Arc::new(MemoryEnvironment::new()));
    let channel = Channel::new(
        ChannelId::new(1),
        "queue.paging",
        ChannelConfig::new(paging, true),
        store.clone(),
        pm.clone(),
    )
    .unwrap();
    (channel, store, pm)
}

fn send(channel: &Channel, store: &MessageStore, index: usize) {
    let message = Message::new(Destination::queue("paging").unwrap(), Bytes::from(index.to_string()));
    channel.handle(store.reference(message), None).unwrap();
}

fn index_of(delivery: &Delivery) -> usize {
    std::str::from_utf8(&delivery.message().payload).unwrap().parse().unwrap()
}

#[test]
fn test_evicted_references_reload_in_order() {
    let paging = PagingConfig::new(10, 5, 5);
    let (channel, store, pm) = channel(paging);
    for i in 0..15 {
        send(&channel, &store, i);
    }
    assert_eq!(channel.memory_ref_count(), 10);
    assert_eq!(channel.paged_count(), 5);
    assert_eq!(pm.paged_count("queue.paging").unwrap(), 5);
    assert_eq!(store.size(), 10);

    let sink = Sink::new(true);
    channel.add_receiver(sink.clone()).unwrap();
    let delivered = sink.take();
    assert_eq!(delivered.iter().map(index_of).collect::<Vec<_>>(), (0..15).collect::<Vec<_>>());
    assert_eq!(channel.paged_count(), 0);
    assert_eq!(pm.paged_count("queue.paging").unwrap(), 0);

    for delivery in &delivered {
        delivery.acknowledge(None).unwrap();
    }
    assert_eq!(channel.message_count(), 0);
    assert_eq!(store.size(), 0);
}

#[derive(Debug, Clone)]
enum Step {
    Send(usize),
    Drain,
}

fn paging_config() -> impl Strategy<Value = PagingConfig> {
    (1usize..20)
        .prop_flat_map(|full| (Just(full), 1..=full))
        .prop_flat_map(|(full, page)| (Just(full), Just(page), 1..=page))
        .prop_map(|(full, page, down_cache)| PagingConfig::new(full, page, down_cache))
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(prop_oneof![(1usize..40).prop_map(Step::Send), Just(Step::Drain)], 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_paging_keeps_fifo_and_counts(paging in paging_config(), steps in steps()) {
        let (channel, store, _pm) = channel(paging);
        let sink = Sink::new(false);
        channel.add_receiver(sink.clone()).unwrap();

        let mut sent = 0;
        let mut order = Vec::new();
        for step in steps {
            match step {
                Step::Send(n) => {
                    for _ in 0..n {
                        send(&channel, &store, sent);
                        sent += 1;
                    }
                },
                Step::Drain => {
                    sink.set_open(true);
                    channel.deliver().unwrap();
                    sink.set_open(false);
                    for delivery in sink.take() {
                        order.push(index_of(&delivery));
                        delivery.acknowledge(None).unwrap();
                    }
                },
            }

            let counts = channel.counts();
            prop_assert_eq!(counts.message_count(), sent - order.len());
            prop_assert!(counts.memory_refs <= paging.full_size);
            prop_assert!(counts.down_cache < paging.down_cache_size);
            prop_assert_eq!(counts.delivering, 0);
            prop_assert_eq!(channel.is_paging(), counts.paged > 0 || counts.down_cache > 0);
        }

        sink.set_open(true);
        channel.deliver().unwrap();
        for delivery in sink.take() {
            order.push(index_of(&delivery));
            delivery.acknowledge(None).unwrap();
        }
        prop_assert_eq!(order, (0..sent).collect::<Vec<_>>());
        prop_assert_eq!(channel.message_count(), 0);
        prop_assert_eq!(store.size(), 0);
    }
}
