//! Common imports for convenient usage.

pub use crate::{
    config::{CourierConfig, PagingConfig},
    delegate::{
        AckInfo, BrowserDelegate, ClientDelivery, ConnectionDelegate, ConnectionFactoryDelegate,
        ConsumerDelegate, ConsumerSpec, CreateConnectionResult, DeliveryListener,
        FailureListener, ProducerDelegate, SessionDelegate, TransactionPayload,
        TransactionRequest,
    },
    error::{Error, Result},
    message::{Destination, Message, MessageBuilder, MessageId},
    types::{
        AckMode, BrowserId, ChannelId, ConnectionId, ConsumerId, ProducerId, ServerId, SessionId,
        Timestamp, Xid,
    },
};
