//! # Courier Core
//!
//! Shared foundation of the Courier message broker: identifiers, messages and
//! destinations, the error taxonomy, configuration, logging bootstrap, and the
//! capability traits through which clients talk to servers.
//!
//! ## Architecture
//!
//! - [`message`]: messages, message ids and destinations
//! - [`types`]: endpoint identifiers, acknowledgement modes and XA ids
//! - [`delegate`]: connection/session/consumer/producer/browser capabilities
//! - [`config`]: layered configuration with validation
//! - [`telemetry`]: `tracing` subscriber setup
//! - [`error`]: error types and result handling

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod delegate;
pub mod error;
pub mod message;
pub mod prelude;
pub mod telemetry;
pub mod types;

pub use crate::{
    config::{ConfigLoader, CourierConfig, PagingConfig},
    error::{Error, Result},
    message::{Destination, Message, MessageBuilder, MessageId},
    types::{AckMode, ServerId, Timestamp, Xid},
};
