//! Storage abstractions.
//!
//! Calls are blocking: the broker invokes them while holding a channel lock,
//! so implementations must bound their latency.

use crate::{error::StorageResult, transactions::TxHandle};
use courier_core::Xid;
use std::sync::Arc;

/// A keyed record store inside an [`Environment`].
///
/// Writes addressed to a transaction are invisible to `get`/`scan` until that
/// transaction commits.
pub trait Database: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Store `bytes[offset..offset + length]` under `id`.
    fn put(
        &self,
        tx: Option<&TxHandle>,
        id: u64,
        bytes: &[u8],
        offset: usize,
        length: usize,
    ) -> StorageResult<()>;

    /// Delete the record under `id`. Deleting a missing record is not an error.
    fn remove(&self, tx: Option<&TxHandle>, id: u64) -> StorageResult<()>;

    /// Committed record under `id`.
    fn get(&self, id: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Number of committed records.
    fn size(&self) -> StorageResult<usize>;

    /// All committed records in ascending key order.
    fn scan(&self) -> StorageResult<Vec<(u64, Vec<u8>)>>;

    /// The first `limit` committed records in ascending key order.
    fn scan_first(&self, limit: usize) -> StorageResult<Vec<(u64, Vec<u8>)>>;
}

/// A transactional storage environment with XA support.
///
/// XA work follows `start_work → end_work → prepare → commit | rollback`.
/// Every out-of-order call fails with an illegal-state error and leaves other
/// branches untouched. Prepared branches survive `stop`/`start` and are listed
/// by [`Environment::in_doubt_xids`] until resolved.
pub trait Environment: Send + Sync {
    /// Open the environment.
    fn start(&self) -> StorageResult<()>;

    /// Close the environment, discarding unprepared work.
    fn stop(&self) -> StorageResult<()>;

    /// Whether the environment is open.
    fn is_started(&self) -> bool;

    /// Open (creating if needed) the named database.
    fn database(&self, name: &str) -> StorageResult<Arc<dyn Database>>;

    /// Remove the named database and all its committed records.
    fn drop_database(&self, name: &str) -> StorageResult<()>;

    /// Begin a local transaction.
    fn begin(&self) -> StorageResult<TxHandle>;

    /// Commit a local transaction.
    fn commit_local(&self, tx: &TxHandle) -> StorageResult<()>;

    /// Roll back a local transaction.
    fn rollback_local(&self, tx: &TxHandle) -> StorageResult<()>;

    /// Start XA work on `xid`; returns the handle writes must carry.
    fn start_work(&self, xid: &Xid) -> StorageResult<TxHandle>;

    /// End XA work; `failed` marks the branch rollback-only.
    fn end_work(&self, xid: &Xid, failed: bool) -> StorageResult<()>;

    /// Prepare an ended branch.
    fn prepare(&self, xid: &Xid) -> StorageResult<()>;

    /// Commit a prepared branch.
    fn commit(&self, xid: &Xid) -> StorageResult<()>;

    /// Roll back an ended or prepared branch.
    fn rollback(&self, xid: &Xid) -> StorageResult<()>;

    /// Prepared, unresolved branches.
    fn in_doubt_xids(&self) -> StorageResult<Vec<Xid>>;
}
