//! Channel throughput with and without paging.

use bytes::Bytes;
use courier_broker::{Channel, ChannelConfig, Delivery, MessageStore, Offer, Receiver};
use courier_core::{
    types::{ChannelId, ConsumerId},
    Destination, Message, PagingConfig,
};
use courier_storage::{MemoryEnvironment, PersistenceManager};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parking_lot::Mutex;
use std::sync::Arc;

const MESSAGES: usize = 10_000;

#[derive(Default)]
struct Drain {
    received: Mutex<Vec<Delivery>>,
}

impl Receiver for Drain {
    fn receiver_id(&self) -> ConsumerId {
        ConsumerId::new(1)
    }

    fn offer(&self, delivery: &Delivery) -> Offer {
        self.received.lock().push(delivery.clone());
        Offer::Accepted
    }
}

fn channel(full_size: usize) -> (Channel, MessageStore) {
    let store = MessageStore::new();
    let pm = PersistenceManager::new(Arc::new(MemoryEnvironment::new()));
    let paging = PagingConfig::new(full_size, (full_size / 4).max(1), (full_size / 4).max(1));
    let channel =
        Channel::new(ChannelId::new(1), "queue.bench", ChannelConfig::new(paging, false), store.clone(), pm)
            .expect("valid paging bounds");
    (channel, store)
}

fn message(payload: &Bytes) -> Message {
    Message::new(Destination::Queue("bench".to_string()), payload.clone())
}

fn bench_send_then_drain(c: &mut Criterion) {
    let payload = Bytes::from(vec![42u8; 256]);
    let mut group = c.benchmark_group("channel_send_drain");
    group.throughput(Throughput::Elements(MESSAGES as u64));

    for full_size in [MESSAGES * 2, MESSAGES / 10, MESSAGES / 100] {
        group.bench_with_input(BenchmarkId::from_parameter(full_size), &full_size, |b, &full_size| {
            b.iter(|| {
                let (channel, store) = channel(full_size);
                for _ in 0..MESSAGES {
                    channel.handle(store.reference(message(&payload)), None).expect("send");
                }
                let drain = Arc::new(Drain::default());
                channel.add_receiver(drain.clone()).expect("receiver");
                let received = std::mem::take(&mut *drain.received.lock());
                for delivery in received {
                    delivery.acknowledge(None).expect("ack");
                }
                black_box(channel.message_count())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_send_then_drain);
criterion_main!(benches);
