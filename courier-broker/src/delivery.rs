//! In-flight delivery handles.

use crate::{channel::Channel, transaction::Transaction};
use courier_core::{types::ChannelId, types::ConsumerId, Message, MessageId, Result};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// "Reference X is being delivered to receiver Y".
///
/// Cloning shares the done flag. A delivery is done once it has been
/// acknowledged, cancelled, or handed to another receiver.
#[derive(Clone)]
pub struct Delivery {
    channel: Channel,
    message: Arc<Message>,
    sequence: u64,
    receiver_id: ConsumerId,
    delivery_count: u32,
    done: Arc<AtomicBool>,
}

impl Delivery {
    pub(crate) fn new(
        channel: Channel,
        message: Arc<Message>,
        sequence: u64,
        receiver_id: ConsumerId,
        delivery_count: u32,
    ) -> Self {
        Self {
            channel,
            message,
            sequence,
            receiver_id,
            delivery_count,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The delivered message.
    #[must_use]
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Id of the delivered message.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message.id
    }

    /// Receiver the message is delivered to.
    #[must_use]
    pub fn receiver_id(&self) -> ConsumerId {
        self.receiver_id
    }

    /// Channel the reference belongs to.
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Channel-local sequence of the reference.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Delivery attempts including this one.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Whether the delivery has been completed or cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Acknowledge the delivery, immediately or as part of `tx`.
    ///
    /// # Errors
    /// `IllegalState` when the delivery is no longer outstanding, `Storage`
    /// when the durable record cannot be removed.
    pub fn acknowledge(&self, tx: Option<&Transaction>) -> Result<()> {
        self.channel.acknowledge_delivery(self, tx)
    }

    /// Return the reference to the front of its channel.
    ///
    /// # Errors
    /// `IllegalState` when the delivery is no longer outstanding.
    pub fn cancel(&self) -> Result<()> {
        self.channel.cancel_delivery(self)
    }

    pub(crate) fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("channel", &self.channel.name())
            .field("message_id", &self.message.id)
            .field("receiver_id", &self.receiver_id)
            .field("delivery_count", &self.delivery_count)
            .field("done", &self.is_done())
            .finish()
    }
}
