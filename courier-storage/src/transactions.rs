//! Transaction bookkeeping shared by storage backends.
//!
//! [`BranchTable`] owns the XA state machine; backends keep one per
//! environment and consult it before touching data.

use crate::error::{StorageError, StorageResult};
use courier_core::Xid;
use std::collections::HashMap;
use std::fmt;

/// Local transaction identifier type
pub type LocalTxId = u64;

/// Transaction a write is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxHandle {
    /// A local (one-phase) transaction
    Local(LocalTxId),
    /// An XA branch
    Xa(Xid),
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxHandle::Local(id) => write!(f, "local:{id}"),
            TxHandle::Xa(xid) => write!(f, "xa:{xid}"),
        }
    }
}

/// A buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Store a record
    Put {
        /// Target database
        database: String,
        /// Record key
        id: u64,
        /// Record bytes
        bytes: Vec<u8>,
    },
    /// Delete a record
    Remove {
        /// Target database
        database: String,
        /// Record key
        id: u64,
    },
}

/// Writes buffered by one transaction, applied in order on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    ops: Vec<WriteOp>,
}

impl WorkSet {
    /// Append a write.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Buffered writes in submission order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Take ownership of the buffered writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// XA branch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaState {
    /// Between `start_work` and `end_work`; writes accepted
    Started,
    /// Work ended, awaiting `prepare` or `rollback`
    Ended,
    /// Durably prepared, awaiting `commit` or `rollback`
    Prepared,
}

/// One XA branch.
#[derive(Debug, Clone)]
pub struct XaBranch {
    /// Current state
    pub state: XaState,
    /// Whether `end_work` reported failure
    pub rollback_only: bool,
    /// Buffered writes
    pub work: WorkSet,
}

/// XA state machine for every branch of an environment.
#[derive(Debug, Default)]
pub struct BranchTable {
    branches: HashMap<Xid, XaBranch>,
}

impl BranchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin work on an unknown xid.
    pub fn start(&mut self, xid: &Xid) -> StorageResult<()> {
        if let Some(branch) = self.branches.get(xid) {
            return Err(StorageError::illegal_state(format!(
                "cannot start work on {xid}: branch is {:?}",
                branch.state
            )));
        }
        self.branches.insert(
            xid.clone(),
            XaBranch { state: XaState::Started, rollback_only: false, work: WorkSet::default() },
        );
        Ok(())
    }

    /// End work on a started xid.
    pub fn end(&mut self, xid: &Xid, failed: bool) -> StorageResult<()> {
        let branch = self.expect_state(xid, XaState::Started, "end work on")?;
        branch.state = XaState::Ended;
        branch.rollback_only = failed;
        Ok(())
    }

    /// Prepare an ended xid.
    pub fn prepare(&mut self, xid: &Xid) -> StorageResult<()> {
        let branch = self.expect_state(xid, XaState::Ended, "prepare")?;
        if branch.rollback_only {
            return Err(StorageError::illegal_state(format!(
                "cannot prepare {xid}: branch is marked rollback-only"
            )));
        }
        branch.state = XaState::Prepared;
        Ok(())
    }

    /// Remove a prepared xid for commit, returning its work.
    pub fn take_for_commit(&mut self, xid: &Xid) -> StorageResult<WorkSet> {
        self.expect_state(xid, XaState::Prepared, "commit")?;
        Ok(self.branches.remove(xid).map(|branch| branch.work).unwrap_or_default())
    }

    /// Remove an ended or prepared xid for rollback.
    pub fn take_for_rollback(&mut self, xid: &Xid) -> StorageResult<()> {
        match self.branches.get(xid).map(|branch| branch.state) {
            Some(XaState::Ended | XaState::Prepared) => {
                self.branches.remove(xid);
                Ok(())
            },
            Some(state) => Err(StorageError::illegal_state(format!(
                "cannot roll back {xid}: branch is {state:?}"
            ))),
            None => Err(StorageError::illegal_state(format!("cannot roll back unknown {xid}"))),
        }
    }

    /// Work set of a started xid, for buffering a write.
    pub fn work_mut(&mut self, xid: &Xid) -> StorageResult<&mut WorkSet> {
        Ok(&mut self.expect_state(xid, XaState::Started, "write under")?.work)
    }

    /// Discard every branch that has not reached `Prepared`.
    pub fn discard_unprepared(&mut self) -> usize {
        let before = self.branches.len();
        self.branches.retain(|_, branch| branch.state == XaState::Prepared);
        before - self.branches.len()
    }

    /// Prepared xids.
    #[must_use]
    pub fn prepared(&self) -> Vec<Xid> {
        self.branches
            .iter()
            .filter(|(_, branch)| branch.state == XaState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect()
    }

    /// State of `xid`, if known.
    #[must_use]
    pub fn state(&self, xid: &Xid) -> Option<XaState> {
        self.branches.get(xid).map(|branch| branch.state)
    }

    fn expect_state(
        &mut self,
        xid: &Xid,
        expected: XaState,
        action: &str,
    ) -> StorageResult<&mut XaBranch> {
        match self.branches.get_mut(xid) {
            Some(branch) if branch.state == expected => Ok(branch),
            Some(branch) => Err(StorageError::illegal_state(format!(
                "cannot {action} {xid}: branch is {:?}, expected {expected:?}",
                branch.state
            ))),
            None => Err(StorageError::illegal_state(format!("cannot {action} unknown {xid}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid(n: u8) -> Xid {
        Xid::new(1, vec![n], vec![])
    }

    #[test]
    fn test_full_lifecycle() {
        let mut table = BranchTable::new();
        let x = xid(1);
        table.start(&x).unwrap();
        table.work_mut(&x).unwrap().push(WriteOp::Remove { database: "d".into(), id: 1 });
        table.end(&x, false).unwrap();
        table.prepare(&x).unwrap();
        assert_eq!(table.prepared(), vec![x.clone()]);
        let work = table.take_for_commit(&x).unwrap();
        assert_eq!(work.ops().len(), 1);
        assert!(table.state(&x).is_none());
        // Forgotten after completion, so it can start again
        table.start(&x).unwrap();
    }

    #[test]
    fn test_rollback_only_branch_cannot_prepare() {
        let mut table = BranchTable::new();
        let x = xid(2);
        table.start(&x).unwrap();
        table.end(&x, true).unwrap();
        assert!(table.prepare(&x).is_err());
        table.take_for_rollback(&x).unwrap();
    }

    #[test]
    fn test_discard_unprepared_keeps_prepared() {
        let mut table = BranchTable::new();
        let (a, b) = (xid(3), xid(4));
        table.start(&a).unwrap();
        table.start(&b).unwrap();
        table.end(&b, false).unwrap();
        table.prepare(&b).unwrap();
        assert_eq!(table.discard_unprepared(), 1);
        assert_eq!(table.prepared(), vec![b]);
        assert!(table.state(&a).is_none());
    }
}
