//! # Courier Storage
//!
//! Persistence collaborator of the broker: a transactional, XA-capable
//! storage [`Environment`] and the [`PersistenceManager`] the paging engine
//! and transaction repository write through.
//!
//! The in-memory backend keeps committed data across `stop`/`start`, which is
//! how crash recovery is exercised in tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod error;
pub mod persistence;
pub mod traits;
pub mod transactions;

pub use backends::{MemoryEnvironment, MemoryEnvironmentConfig};
pub use error::{StorageError, StorageResult};
pub use persistence::{
    PersistenceManager, ReferenceRecord, TransactionOpRecord, TransactionRecord,
};
pub use traits::{Database, Environment};
pub use transactions::{TxHandle, XaState};
