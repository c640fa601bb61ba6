//! Storage error types.
//!
//! Lifecycle and XA ordering violations are reported as
//! [`StorageError::IllegalState`]/[`StorageError::NotStarted`] so callers can
//! tell protocol misuse apart from genuine write failures.

use courier_core::Error;
use thiserror::Error;

/// Storage operation result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Error enumeration for storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Operation attempted while the environment is stopped
    #[error("Storage environment is not started")]
    NotStarted,

    /// Operation invalid in the current lifecycle or transaction state
    #[error("Illegal storage state: {reason}")]
    IllegalState {
        /// What was attempted and why it is not allowed
        reason: String,
    },

    /// Byte range outside the supplied buffer
    #[error("Invalid range: offset {offset} + length {length} exceeds buffer of {size} bytes")]
    InvalidRange {
        /// Requested start offset
        offset: usize,
        /// Requested length
        length: usize,
        /// Actual buffer size
        size: usize,
    },

    /// Write operation failed
    #[error("Write to '{database}' failed: {reason}")]
    WriteFailed {
        /// Database the write addressed
        database: String,
        /// Specific reason for write failure
        reason: String,
    },

    /// Record could not be encoded or decoded
    #[error("Serialization failed: {reason}")]
    Serialization {
        /// Codec error
        reason: String,
    },
}

impl StorageError {
    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        StorageError::IllegalState { reason: reason.into() }
    }

    /// Whether this error is a lifecycle or XA ordering violation.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, StorageError::IllegalState { .. } | StorageError::NotStarted)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization { reason: err.to_string() }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        if err.is_illegal_state() {
            Error::IllegalState { message: err.to_string() }
        } else {
            Error::Storage { message: err.to_string() }
        }
    }
}
