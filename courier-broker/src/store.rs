//! In-memory message body cache.
//!
//! A body stays cached while at least one [`MessageReference`] to it is held
//! in memory by some channel. References release their count when dropped, so
//! paging a reference out, acknowledging it or deleting its channel all shrink
//! the cache without explicit bookkeeping.

use courier_core::{types::ChannelId, Message, MessageId};
use courier_storage::ReferenceRecord;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{fmt, sync::Arc};
use tracing::trace;

struct StoreEntry {
    message: Arc<Message>,
    references: usize,
}

#[derive(Default)]
struct StoreInner {
    entries: DashMap<MessageId, StoreEntry>,
}

impl StoreInner {
    fn release(&self, id: &MessageId) {
        if let Entry::Occupied(mut entry) = self.entries.entry(*id) {
            entry.get_mut().references -= 1;
            if entry.get().references == 0 {
                entry.remove();
                trace!(message_id = %id, "Evicted message body");
            }
        }
    }
}

/// Reference-counted cache of message bodies shared by all channels.
#[derive(Clone, Default)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a reference to `message`, caching its body.
    ///
    /// If the body is already cached the existing copy is shared.
    pub fn reference(&self, message: impl Into<Arc<Message>>) -> MessageReference {
        let message = message.into();
        let id = message.id;
        let message = match self.inner.entries.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().references += 1;
                Arc::clone(&entry.get().message)
            },
            Entry::Vacant(entry) => {
                entry.insert(StoreEntry { message: Arc::clone(&message), references: 1 });
                message
            },
        };
        MessageReference {
            message,
            channel_id: None,
            sequence: 0,
            order: 0,
            delivery_count: 0,
            _guard: StoreGuard { store: Arc::clone(&self.inner), id },
        }
    }

    /// Rebuild a reference from its stored form.
    pub fn reference_from_record(&self, record: ReferenceRecord) -> MessageReference {
        let mut reference = self.reference(record.message);
        reference.sequence = record.sequence;
        reference.order = record.order;
        reference.delivery_count = record.delivery_count;
        reference
    }

    /// Number of distinct bodies currently cached.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the body of `id` is cached.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Number of in-memory references to `id`.
    #[must_use]
    pub fn reference_count(&self, id: &MessageId) -> usize {
        self.inner.entries.get(id).map_or(0, |entry| entry.references)
    }
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore").field("size", &self.size()).finish()
    }
}

struct StoreGuard {
    store: Arc<StoreInner>,
    id: MessageId,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        self.store.release(&self.id);
    }
}

/// A message scoped to one channel.
///
/// Exists in at most one place at a time: a channel's window, its down-cache,
/// or an in-flight delivery. Paged references exist only as storage records.
pub struct MessageReference {
    message: Arc<Message>,
    channel_id: Option<ChannelId>,
    sequence: u64,
    order: u64,
    delivery_count: u32,
    _guard: StoreGuard,
}

impl MessageReference {
    /// The referenced message.
    #[must_use]
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Id of the referenced message.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message.id
    }

    /// Owning channel, once the reference has been handed to one.
    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel_id
    }

    /// Channel-local enqueue sequence.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Position in the channel's FIFO, fixed when the reference becomes
    /// visible. Equals the sequence unless the reference was enqueued in a
    /// transaction.
    #[must_use]
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Delivery attempts so far.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Whether the message is persistent.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.message.persistent
    }

    pub(crate) fn bind(&mut self, channel_id: ChannelId, sequence: u64) {
        self.channel_id = Some(channel_id);
        self.sequence = sequence;
        self.order = sequence;
    }

    /// Hand a reference rebuilt from its record back to its channel.
    pub(crate) fn attach(&mut self, channel_id: ChannelId) {
        self.channel_id = Some(channel_id);
    }

    pub(crate) fn set_order(&mut self, order: u64) {
        self.order = order;
    }

    pub(crate) fn increment_delivery_count(&mut self) {
        self.delivery_count += 1;
    }

    pub(crate) fn to_record(&self) -> ReferenceRecord {
        ReferenceRecord {
            sequence: self.sequence,
            order: self.order,
            delivery_count: self.delivery_count,
            message: Message::clone(&self.message),
        }
    }
}

impl fmt::Debug for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReference")
            .field("message_id", &self.message.id)
            .field("channel_id", &self.channel_id)
            .field("sequence", &self.sequence)
            .field("order", &self.order)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
