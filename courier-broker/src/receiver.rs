//! Receivers a channel delivers to.

use crate::delivery::Delivery;
use courier_core::types::ConsumerId;

/// Answer of a receiver to a delivery offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The receiver took the delivery
    Accepted,
    /// The receiver does not want this message; try the next reference
    NotMatched,
    /// The receiver cannot take anything right now
    Busy,
}

/// Something a channel can push deliveries to.
///
/// `offer` runs while the channel lock is held and must not call back into
/// the channel.
pub trait Receiver: Send + Sync {
    /// Identity used to attribute in-flight deliveries.
    fn receiver_id(&self) -> ConsumerId;

    /// Offer a delivery.
    fn offer(&self, delivery: &Delivery) -> Offer;
}
