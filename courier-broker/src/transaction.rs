//! Server-side transactions.
//!
//! A [`Transaction`] stages enqueues and acknowledgements against channels.
//! Nothing becomes visible before commit: durable effects are written through
//! the persistence manager first, then applied to the channels. XA
//! transactions additionally pass through a prepare phase whose record
//! survives a restart, so in-doubt branches can be completed afterwards.

use crate::{channel::Channel, destination::DestinationManager, store::MessageReference};
use courier_core::{Error, MessageId, Result, Xid};
use courier_storage::{PersistenceManager, TransactionOpRecord, TransactionRecord, TxHandle};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};

/// Lifecycle of a server transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work
    Active,
    /// Durably prepared, waiting for the outcome
    Prepared,
    /// Effects applied
    Committed,
    /// Effects discarded
    RolledBack,
}

pub(crate) enum TxOperation {
    Enqueue { channel: Channel, reference: MessageReference },
    Acknowledge { channel: Channel, message_id: MessageId, sequence: u64, persistent: bool },
}

impl TxOperation {
    fn record(&self) -> Option<TransactionOpRecord> {
        match self {
            TxOperation::Enqueue { channel, reference } if channel.persists(reference) => {
                Some(TransactionOpRecord::Enqueue {
                    channel: channel.name().to_string(),
                    sequence: reference.sequence(),
                    message: reference.message().as_ref().clone(),
                })
            },
            TxOperation::Acknowledge { channel, message_id, sequence, persistent }
                if channel.is_recoverable() && *persistent =>
            {
                Some(TransactionOpRecord::Acknowledge {
                    channel: channel.name().to_string(),
                    message_id: *message_id,
                    sequence: *sequence,
                })
            },
            _ => None,
        }
    }

    fn write(&self, pm: &PersistenceManager, handle: &TxHandle) -> Result<()> {
        match self {
            TxOperation::Enqueue { channel, reference } if channel.persists(reference) => {
                pm.add_reference(channel.name(), &reference.to_record(), Some(handle))?;
            },
            TxOperation::Acknowledge { channel, sequence, persistent, .. }
                if channel.is_recoverable() && *persistent =>
            {
                pm.remove_reference(channel.name(), *sequence, Some(handle))?;
            },
            _ => {},
        }
        Ok(())
    }

    fn apply_commit(self) {
        match self {
            TxOperation::Enqueue { channel, reference } => channel.commit_enqueue(reference),
            TxOperation::Acknowledge { channel, message_id, .. } => {
                channel.commit_acknowledge(message_id);
            },
        }
    }

    fn apply_rollback(self) {
        if let TxOperation::Acknowledge { channel, message_id, .. } = self {
            channel.rollback_acknowledge(message_id);
        }
    }
}

struct TxData {
    state: TransactionState,
    operations: Vec<TxOperation>,
    record_id: Option<u64>,
}

struct TxInner {
    id: u64,
    xid: Option<Xid>,
    pm: PersistenceManager,
    data: Mutex<TxData>,
}

/// A unit of atomic enqueue/acknowledge work.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    fn with_state(
        id: u64,
        xid: Option<Xid>,
        pm: PersistenceManager,
        state: TransactionState,
        operations: Vec<TxOperation>,
        record_id: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(TxInner {
                id,
                xid,
                pm,
                data: Mutex::new(TxData { state, operations, record_id }),
            }),
        }
    }

    /// Transaction id, unique per server run.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Branch id of an XA transaction.
    #[must_use]
    pub fn xid(&self) -> Option<&Xid> {
        self.inner.xid.as_ref()
    }

    /// Whether this transaction takes part in two-phase commit.
    #[must_use]
    pub fn is_xa(&self) -> bool {
        self.inner.xid.is_some()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.data.lock().state
    }

    /// Number of staged operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.inner.data.lock().operations.len()
    }

    pub(crate) fn add_enqueue(&self, channel: Channel, reference: MessageReference) -> Result<()> {
        self.stage(TxOperation::Enqueue { channel, reference })
    }

    pub(crate) fn add_acknowledge(
        &self,
        channel: Channel,
        message_id: MessageId,
        sequence: u64,
        persistent: bool,
    ) -> Result<()> {
        self.stage(TxOperation::Acknowledge { channel, message_id, sequence, persistent })
    }

    fn stage(&self, operation: TxOperation) -> Result<()> {
        let mut data = self.inner.data.lock();
        if data.state != TransactionState::Active {
            return Err(Error::illegal_state(format!(
                "transaction {} is {:?}, not active",
                self.inner.id, data.state
            )));
        }
        data.operations.push(operation);
        Ok(())
    }

    /// First phase of two-phase commit.
    ///
    /// On failure the branch is rolled back in storage and the transaction
    /// stays active.
    ///
    /// # Errors
    /// `IllegalState` for a one-phase transaction or one that is not active,
    /// `Storage` when the prepare cannot be made durable.
    pub fn prepare(&self) -> Result<()> {
        let xid = self
            .inner
            .xid
            .clone()
            .ok_or_else(|| Error::illegal_state("a one-phase transaction cannot be prepared"))?;
        let mut data = self.inner.data.lock();
        if data.state != TransactionState::Active {
            return Err(Error::illegal_state(format!("cannot prepare transaction in state {:?}", data.state)));
        }

        let pm = &self.inner.pm;
        let record = TransactionRecord {
            xid: xid.clone(),
            operations: data.operations.iter().filter_map(TxOperation::record).collect(),
        };
        pm.put_transaction_record(self.inner.id, &record)?;

        let prepared = (|| -> Result<()> {
            let handle = pm.start_work(&xid)?;
            let written = data.operations.iter().try_for_each(|op| op.write(pm, &handle));
            pm.end_work(&xid, written.is_err())?;
            written?;
            pm.prepare(&xid)?;
            Ok(())
        })();

        if let Err(err) = prepared {
            warn!(tx = self.inner.id, %xid, %err, "Prepare failed, rolling back branch");
            if let Err(undo) = pm.rollback(&xid) {
                debug!(tx = self.inner.id, %undo, "Nothing to roll back");
            }
            if let Err(undo) = pm.remove_transaction_record(self.inner.id) {
                error!(tx = self.inner.id, %undo, "Failed to remove transaction record");
            }
            return Err(err);
        }

        data.state = TransactionState::Prepared;
        data.record_id = Some(self.inner.id);
        debug!(tx = self.inner.id, %xid, operations = data.operations.len(), "Prepared transaction");
        Ok(())
    }

    /// Make the staged work durable and visible.
    ///
    /// A one-phase commit that fails in storage rolls the transaction back.
    ///
    /// # Errors
    /// `IllegalState` when the transaction cannot be committed in its current
    /// state (including an XA transaction that was not prepared), `Storage`
    /// when the commit cannot be made durable.
    pub fn commit(&self) -> Result<()> {
        let mut data = self.inner.data.lock();
        let pm = &self.inner.pm;
        match (data.state, &self.inner.xid) {
            (TransactionState::Active, None) => {
                let handle = pm.begin()?;
                let written = data
                    .operations
                    .iter()
                    .try_for_each(|op| op.write(pm, &handle))
                    .and_then(|()| pm.commit_local(&handle).map_err(Error::from));
                if let Err(err) = written {
                    warn!(tx = self.inner.id, %err, "Commit failed, rolling back");
                    if let Err(undo) = pm.rollback_local(&handle) {
                        debug!(tx = self.inner.id, %undo, "Storage transaction already discarded");
                    }
                    data.state = TransactionState::RolledBack;
                    let operations = mem::take(&mut data.operations);
                    drop(data);
                    operations.into_iter().for_each(TxOperation::apply_rollback);
                    return Err(err);
                }
            },
            (TransactionState::Prepared, Some(xid)) => {
                pm.commit(xid)?;
                if let Some(record_id) = data.record_id.take() {
                    if let Err(err) = pm.remove_transaction_record(record_id) {
                        error!(tx = self.inner.id, %err, "Failed to remove transaction record");
                    }
                }
            },
            (TransactionState::Active, Some(xid)) => {
                return Err(Error::illegal_state(format!("XA transaction {xid} must be prepared before commit")));
            },
            (state, _) => {
                return Err(Error::illegal_state(format!("cannot commit transaction in state {state:?}")));
            },
        }

        data.state = TransactionState::Committed;
        let operations = mem::take(&mut data.operations);
        drop(data);
        debug!(tx = self.inner.id, operations = operations.len(), "Committed transaction");
        operations.into_iter().for_each(TxOperation::apply_commit);
        Ok(())
    }

    /// Discard the staged work.
    ///
    /// # Errors
    /// `IllegalState` for a completed transaction, `Storage` when a prepared
    /// branch cannot be rolled back.
    pub fn rollback(&self) -> Result<()> {
        let mut data = self.inner.data.lock();
        match data.state {
            TransactionState::Active => {},
            TransactionState::Prepared => {
                if let Some(xid) = &self.inner.xid {
                    self.inner.pm.rollback(xid)?;
                }
                if let Some(record_id) = data.record_id.take() {
                    if let Err(err) = self.inner.pm.remove_transaction_record(record_id) {
                        error!(tx = self.inner.id, %err, "Failed to remove transaction record");
                    }
                }
            },
            state => {
                return Err(Error::illegal_state(format!("cannot roll back transaction in state {state:?}")));
            },
        }

        data.state = TransactionState::RolledBack;
        let operations = mem::take(&mut data.operations);
        drop(data);
        debug!(tx = self.inner.id, operations = operations.len(), "Rolled back transaction");
        operations.into_iter().for_each(TxOperation::apply_rollback);
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("xid", &self.inner.xid)
            .field("state", &self.state())
            .finish()
    }
}

/// Creates transactions and tracks the XA ones by branch id.
pub struct TransactionRepository {
    pm: PersistenceManager,
    transactions: DashMap<Xid, Transaction>,
    next_id: AtomicU64,
}

impl TransactionRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new(pm: PersistenceManager) -> Self {
        Self { pm, transactions: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a one-phase transaction.
    #[must_use]
    pub fn create_transaction(&self) -> Transaction {
        Transaction::with_state(
            self.next_id(),
            None,
            self.pm.clone(),
            TransactionState::Active,
            Vec::new(),
            None,
        )
    }

    /// Start an XA transaction for `xid`.
    ///
    /// # Errors
    /// `IllegalState` when a transaction for `xid` already exists.
    pub fn create_xa_transaction(&self, xid: Xid) -> Result<Transaction> {
        match self.transactions.entry(xid) {
            Entry::Occupied(entry) => {
                Err(Error::illegal_state(format!("transaction {} already exists", entry.key())))
            },
            Entry::Vacant(entry) => {
                let tx = Transaction::with_state(
                    self.next_id(),
                    Some(entry.key().clone()),
                    self.pm.clone(),
                    TransactionState::Active,
                    Vec::new(),
                    None,
                );
                entry.insert(tx.clone());
                Ok(tx)
            },
        }
    }

    /// The XA transaction for `xid`.
    #[must_use]
    pub fn get(&self, xid: &Xid) -> Option<Transaction> {
        self.transactions.get(xid).map(|tx| tx.clone())
    }

    fn require(&self, xid: &Xid) -> Result<Transaction> {
        self.get(xid).ok_or_else(|| Error::illegal_state(format!("unknown transaction {xid}")))
    }

    /// Prepare the XA transaction for `xid`.
    ///
    /// # Errors
    /// `IllegalState` for an unknown branch, otherwise as [`Transaction::prepare`].
    pub fn prepare(&self, xid: &Xid) -> Result<()> {
        self.require(xid)?.prepare()
    }

    /// Commit the XA transaction for `xid` and forget it.
    ///
    /// # Errors
    /// `IllegalState` for an unknown branch, otherwise as [`Transaction::commit`].
    pub fn commit(&self, xid: &Xid) -> Result<()> {
        self.require(xid)?.commit()?;
        self.transactions.remove(xid);
        Ok(())
    }

    /// Roll back the XA transaction for `xid` and forget it.
    ///
    /// # Errors
    /// `IllegalState` for an unknown branch, otherwise as [`Transaction::rollback`].
    pub fn rollback(&self, xid: &Xid) -> Result<()> {
        self.require(xid)?.rollback()?;
        self.transactions.remove(xid);
        Ok(())
    }

    /// Prepared branches waiting for an outcome.
    #[must_use]
    pub fn in_doubt_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().state() == TransactionState::Prepared)
            .map(|entry| entry.key().clone())
            .collect();
        xids.sort_by_key(ToString::to_string);
        xids
    }

    /// Number of tracked XA transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether no XA transaction is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Rebuild prepared transactions from storage after a restart.
    ///
    /// Channels must already be recovered. Records whose branch is no longer
    /// in doubt are stale and removed.
    ///
    /// # Errors
    /// `Storage` when records cannot be read, `IllegalState` when an
    /// acknowledged reference cannot be found in its channel.
    pub fn recover(&self, destinations: &DestinationManager) -> Result<usize> {
        let in_doubt: HashSet<Xid> = self.pm.in_doubt_xids()?.into_iter().collect();
        let mut restored = 0;

        for (id, record) in self.pm.transaction_records()? {
            self.next_id.fetch_max(id + 1, Ordering::Relaxed);
            if !in_doubt.contains(&record.xid) {
                debug!(tx = id, xid = %record.xid, "Removing stale transaction record");
                self.pm.remove_transaction_record(id)?;
                continue;
            }

            let mut operations = Vec::with_capacity(record.operations.len());
            for op in record.operations {
                match op {
                    TransactionOpRecord::Enqueue { channel, sequence, message } => {
                        let Some(channel) = destinations.channel_by_name(&channel) else {
                            warn!(tx = id, channel, "Dropping enqueue for unknown channel");
                            continue;
                        };
                        channel.reserve_sequence(sequence);
                        let mut reference = destinations.store().reference(message);
                        reference.bind(channel.id(), sequence);
                        operations.push(TxOperation::Enqueue { channel, reference });
                    },
                    TransactionOpRecord::Acknowledge { channel, message_id, sequence } => {
                        let Some(channel) = destinations.channel_by_name(&channel) else {
                            warn!(tx = id, channel, "Dropping acknowledgement for unknown channel");
                            continue;
                        };
                        channel.restore_pending_acknowledge(message_id)?;
                        operations.push(TxOperation::Acknowledge {
                            channel,
                            message_id,
                            sequence,
                            persistent: true,
                        });
                    },
                }
            }

            let xid = record.xid;
            let tx = Transaction::with_state(
                id,
                Some(xid.clone()),
                self.pm.clone(),
                TransactionState::Prepared,
                operations,
                Some(id),
            );
            self.transactions.insert(xid, tx);
            restored += 1;
        }

        if restored > 0 {
            info!(restored, "Recovered in-doubt transactions");
        }
        Ok(restored)
    }
}

impl fmt::Debug for TransactionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRepository").field("transactions", &self.transactions.len()).finish()
    }
}
