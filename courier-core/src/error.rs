//! Error types for the Courier core library.

use thiserror::Error;

/// Main error type for Courier operations.
///
/// The first five variants form the broker's error taxonomy: state-machine
/// violations, unknown destinations, storage failures, transport faults and
/// exhausted failover. None of them is retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation invalid for the current state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Referenced destination or subscription does not exist or is of the wrong kind
    #[error("Invalid destination: {message}")]
    InvalidDestination { message: String },

    /// Persistence failure during paging or transaction logging
    #[error("Storage failure: {message}")]
    Storage { message: String },

    /// Transport-level disconnect
    #[error("Connection fault: {message}")]
    ConnectionFault { message: String },

    /// Failover hop budget exhausted or target delegate unknown
    #[error("Failover exceeded: {message}")]
    FailoverExceeded { message: String },

    /// Invalid message format or content
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState { message: message.into() }
    }

    /// Shorthand for an [`Error::InvalidDestination`].
    pub fn invalid_destination(message: impl Into<String>) -> Self {
        Error::InvalidDestination { message: message.into() }
    }

    /// Shorthand for an [`Error::ConnectionFault`].
    pub fn connection_fault(message: impl Into<String>) -> Self {
        Error::ConnectionFault { message: message.into() }
    }

    /// Shorthand for an [`Error::FailoverExceeded`].
    pub fn failover_exceeded(message: impl Into<String>) -> Self {
        Error::FailoverExceeded { message: message.into() }
    }

    /// Whether this error is a state-machine violation.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState { .. })
    }

    /// Whether this error originates from the persistence layer.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Configuration { message: err.to_string() }
    }
}
