//! In-memory storage environment.
//!
//! Committed data lives in ordered maps that outlive `stop`/`start`, so a
//! restart can be simulated in process: unprepared work is discarded,
//! prepared XA branches stay in doubt, committed records are untouched.

use crate::{
    error::{StorageError, StorageResult},
    traits::{Database, Environment},
    transactions::{BranchTable, LocalTxId, TxHandle, WorkSet, WriteOp},
};
use courier_core::Xid;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

/// In-memory environment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEnvironmentConfig {
    /// Largest accepted record in bytes
    pub max_record_size: usize,
    /// Start the environment on construction
    pub auto_start: bool,
}

impl Default for MemoryEnvironmentConfig {
    fn default() -> Self {
        Self { max_record_size: 16 * 1024 * 1024, auto_start: true }
    }
}

impl MemoryEnvironmentConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest accepted record
    #[must_use]
    pub fn with_max_record_size(mut self, max_record_size: usize) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    /// Start or not on construction
    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `StorageError::IllegalState` if the record limit is zero
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_record_size == 0 {
            return Err(StorageError::illegal_state("max_record_size must be greater than 0"));
        }
        Ok(())
    }
}

type Records = BTreeMap<u64, Vec<u8>>;

#[derive(Default)]
struct EnvState {
    started: bool,
    databases: HashMap<String, Records>,
    local: HashMap<LocalTxId, WorkSet>,
    next_local: LocalTxId,
    branches: BranchTable,
}

impl EnvState {
    fn ensure_started(&self) -> StorageResult<()> {
        if self.started {
            Ok(())
        } else {
            Err(StorageError::NotStarted)
        }
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put { database, id, bytes } => {
                self.databases.entry(database).or_default().insert(id, bytes);
            },
            WriteOp::Remove { database, id } => {
                if let Some(records) = self.databases.get_mut(&database) {
                    records.remove(&id);
                }
            },
        }
    }

    fn submit(&mut self, tx: Option<&TxHandle>, op: WriteOp) -> StorageResult<()> {
        self.ensure_started()?;
        match tx {
            None => {
                self.apply(op);
                Ok(())
            },
            Some(TxHandle::Local(id)) => match self.local.get_mut(id) {
                Some(work) => {
                    work.push(op);
                    Ok(())
                },
                None => Err(StorageError::illegal_state(format!("unknown local transaction {id}"))),
            },
            Some(TxHandle::Xa(xid)) => {
                self.branches.work_mut(xid)?.push(op);
                Ok(())
            },
        }
    }
}

struct Shared {
    config: MemoryEnvironmentConfig,
    state: Mutex<EnvState>,
    fail_writes: AtomicBool,
}

impl Shared {
    fn check_fault(&self, database: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StorageError::WriteFailed {
                database: database.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory [`Environment`].
#[derive(Clone)]
pub struct MemoryEnvironment {
    shared: Arc<Shared>,
}

impl MemoryEnvironment {
    /// Create a started environment with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(MemoryEnvironmentConfig::default())
    }

    /// Create an environment from `config`.
    #[must_use]
    pub fn from_config(config: MemoryEnvironmentConfig) -> Self {
        let state = EnvState { started: config.auto_start, ..EnvState::default() };
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent write and commit fail until switched off.
    pub fn fail_writes(&self, fail: bool) {
        if fail {
            warn!("Injecting storage write failures");
        }
        self.shared.fail_writes.store(fail, Ordering::Release);
    }

    /// Simulate a crash and restart: `stop` followed by `start`.
    pub fn restart(&self) -> StorageResult<()> {
        self.stop()?;
        self.start()
    }
}

impl Default for MemoryEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for MemoryEnvironment {
    fn start(&self) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        if state.started {
            return Err(StorageError::illegal_state("environment already started"));
        }
        state.started = true;
        info!(in_doubt = state.branches.prepared().len(), "Storage environment started");
        Ok(())
    }

    fn stop(&self) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        let discarded_local = state.local.len();
        state.local.clear();
        let discarded_xa = state.branches.discard_unprepared();
        state.started = false;
        info!(discarded_local, discarded_xa, "Storage environment stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    fn database(&self, name: &str) -> StorageResult<Arc<dyn Database>> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state.databases.entry(name.to_string()).or_default();
        Ok(Arc::new(MemoryDatabase { name: name.to_string(), shared: Arc::clone(&self.shared) }))
    }

    fn drop_database(&self, name: &str) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        if state.databases.remove(name).is_some() {
            debug!(database = name, "Dropped database");
        }
        Ok(())
    }

    fn begin(&self) -> StorageResult<TxHandle> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state.next_local += 1;
        let id = state.next_local;
        state.local.insert(id, WorkSet::default());
        Ok(TxHandle::Local(id))
    }

    fn commit_local(&self, tx: &TxHandle) -> StorageResult<()> {
        let TxHandle::Local(id) = tx else {
            return Err(StorageError::illegal_state(format!("{tx} is not a local transaction")));
        };
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        if !state.local.contains_key(id) {
            return Err(StorageError::illegal_state(format!("unknown local transaction {id}")));
        }
        if let Err(err) = self.shared.check_fault("*") {
            state.local.remove(id);
            return Err(err);
        }
        let work = state.local.remove(id).unwrap_or_default();
        for op in work.into_ops() {
            state.apply(op);
        }
        Ok(())
    }

    fn rollback_local(&self, tx: &TxHandle) -> StorageResult<()> {
        let TxHandle::Local(id) = tx else {
            return Err(StorageError::illegal_state(format!("{tx} is not a local transaction")));
        };
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state
            .local
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::illegal_state(format!("unknown local transaction {id}")))
    }

    fn start_work(&self, xid: &Xid) -> StorageResult<TxHandle> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state.branches.start(xid)?;
        debug!(%xid, "XA work started");
        Ok(TxHandle::Xa(xid.clone()))
    }

    fn end_work(&self, xid: &Xid, failed: bool) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state.branches.end(xid, failed)
    }

    fn prepare(&self, xid: &Xid) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        self.shared.check_fault("*")?;
        state.branches.prepare(xid)?;
        debug!(%xid, "XA branch prepared");
        Ok(())
    }

    fn commit(&self, xid: &Xid) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        if state.branches.state(xid) == Some(crate::transactions::XaState::Prepared) {
            self.shared.check_fault("*")?;
        }
        let work = state.branches.take_for_commit(xid)?;
        for op in work.into_ops() {
            state.apply(op);
        }
        debug!(%xid, "XA branch committed");
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_started()?;
        state.branches.take_for_rollback(xid)?;
        debug!(%xid, "XA branch rolled back");
        Ok(())
    }

    fn in_doubt_xids(&self) -> StorageResult<Vec<Xid>> {
        let state = self.shared.state.lock();
        state.ensure_started()?;
        Ok(state.branches.prepared())
    }
}

struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(
        &self,
        tx: Option<&TxHandle>,
        id: u64,
        bytes: &[u8],
        offset: usize,
        length: usize,
    ) -> StorageResult<()> {
        let end = offset.checked_add(length).filter(|end| *end <= bytes.len()).ok_or(
            StorageError::InvalidRange { offset, length, size: bytes.len() },
        )?;
        if length > self.shared.config.max_record_size {
            return Err(StorageError::WriteFailed {
                database: self.name.clone(),
                reason: format!(
                    "record of {length} bytes exceeds limit of {}",
                    self.shared.config.max_record_size
                ),
            });
        }
        self.shared.check_fault(&self.name)?;
        let op = WriteOp::Put { database: self.name.clone(), id, bytes: bytes[offset..end].to_vec() };
        self.shared.state.lock().submit(tx, op)
    }

    fn remove(&self, tx: Option<&TxHandle>, id: u64) -> StorageResult<()> {
        self.shared.check_fault(&self.name)?;
        let op = WriteOp::Remove { database: self.name.clone(), id };
        self.shared.state.lock().submit(tx, op)
    }

    fn get(&self, id: u64) -> StorageResult<Option<Vec<u8>>> {
        let state = self.shared.state.lock();
        state.ensure_started()?;
        Ok(state.databases.get(&self.name).and_then(|records| records.get(&id).cloned()))
    }

    fn size(&self) -> StorageResult<usize> {
        let state = self.shared.state.lock();
        state.ensure_started()?;
        Ok(state.databases.get(&self.name).map_or(0, BTreeMap::len))
    }

    fn scan(&self) -> StorageResult<Vec<(u64, Vec<u8>)>> {
        self.scan_first(usize::MAX)
    }

    fn scan_first(&self, limit: usize) -> StorageResult<Vec<(u64, Vec<u8>)>> {
        let state = self.shared.state.lock();
        state.ensure_started()?;
        Ok(state
            .databases
            .get(&self.name)
            .map(|records| {
                records.iter().take(limit).map(|(id, bytes)| (*id, bytes.clone())).collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_transactional_put_get_remove() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        db.put(None, 1, b"xxhelloxx", 2, 5).unwrap();
        assert_eq!(db.get(1).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(db.size().unwrap(), 1);
        db.remove(None, 1).unwrap();
        assert_eq!(db.get(1).unwrap(), None);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        assert!(matches!(db.put(None, 1, b"abc", 2, 5), Err(StorageError::InvalidRange { .. })));
    }

    #[test]
    fn test_local_transaction_invisible_until_commit() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        let tx = env.begin().unwrap();
        db.put(Some(&tx), 7, b"v", 0, 1).unwrap();
        assert_eq!(db.size().unwrap(), 0);
        env.commit_local(&tx).unwrap();
        assert_eq!(db.size().unwrap(), 1);
    }

    #[test]
    fn test_local_rollback_discards() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        let tx = env.begin().unwrap();
        db.put(Some(&tx), 7, b"v", 0, 1).unwrap();
        env.rollback_local(&tx).unwrap();
        assert_eq!(db.size().unwrap(), 0);
        assert!(env.commit_local(&tx).is_err());
    }

    #[test]
    fn test_double_start_and_stop_rejected() {
        let env = MemoryEnvironment::new();
        assert!(env.start().is_err());
        env.stop().unwrap();
        assert!(matches!(env.stop(), Err(StorageError::NotStarted)));
        assert!(env.database("x").is_err());
        env.start().unwrap();
    }

    #[test]
    fn test_injected_failure() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        env.fail_writes(true);
        assert!(matches!(db.put(None, 1, b"a", 0, 1), Err(StorageError::WriteFailed { .. })));
        env.fail_writes(false);
        db.put(None, 1, b"a", 0, 1).unwrap();
    }

    #[test]
    fn test_scan_first_is_ordered() {
        let env = MemoryEnvironment::new();
        let db = env.database("data").unwrap();
        for id in [5u64, 1, 3] {
            db.put(None, id, &[id as u8], 0, 1).unwrap();
        }
        let ids: Vec<u64> = db.scan_first(2).unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
