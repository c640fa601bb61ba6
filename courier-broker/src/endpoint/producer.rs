use super::{ConnectionContext, ServerCore};
use async_trait::async_trait;
use courier_core::{delegate::ProducerDelegate, types::ProducerId, Destination, Error, Message, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::trace;

/// Server side of a producer.
pub struct ServerProducer {
    id: ProducerId,
    destination: Destination,
    core: Arc<ServerCore>,
    context: Arc<ConnectionContext>,
    closed: AtomicBool,
}

impl ServerProducer {
    pub(crate) fn new(
        id: ProducerId,
        destination: Destination,
        core: Arc<ServerCore>,
        context: Arc<ConnectionContext>,
    ) -> Self {
        Self { id, destination, core, context, closed: AtomicBool::new(false) }
    }

    /// Destination the producer was created for.
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn close_producer(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl ProducerDelegate for ServerProducer {
    fn producer_id(&self) -> ProducerId {
        self.id
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.context.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::illegal_state(format!("producer {} is closed", self.id)));
        }
        let message_id = message.id;
        let routed = self.core.destinations.route(self.context.stamp(message), None)?;
        trace!(producer = %self.id, %message_id, routed, "Sent message");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_producer();
        Ok(())
    }
}
