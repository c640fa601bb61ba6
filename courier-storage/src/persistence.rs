//! Durable ledger used by the broker.
//!
//! Three kinds of records are kept:
//!
//! - paged references, per channel, keyed by paging order so that a scan
//!   returns them oldest first;
//! - reliable references, per recoverable channel, keyed by the channel's
//!   enqueue sequence;
//! - prepared-transaction records, so in-doubt branches can be rebuilt after a
//!   restart.

use crate::{
    error::StorageResult,
    traits::Environment,
    transactions::TxHandle,
};
use courier_core::{Message, MessageId, Xid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

const TRANSACTIONS_DB: &str = "transactions";

/// A message reference as written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Channel-local enqueue sequence
    pub sequence: u64,
    /// FIFO position, assigned when the reference became visible
    pub order: u64,
    /// Delivery attempts so far
    pub delivery_count: u32,
    /// The referenced message
    pub message: Message,
}

/// One staged operation of a prepared transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOpRecord {
    /// Enqueue `message` on the named channel
    Enqueue {
        /// Channel name
        channel: String,
        /// Sequence reserved on the channel
        sequence: u64,
        /// Message to enqueue
        message: Message,
    },
    /// Acknowledge `message_id` on the named channel
    Acknowledge {
        /// Channel name
        channel: String,
        /// Acknowledged message
        message_id: MessageId,
        /// Channel-local sequence of the acknowledged reference
        sequence: u64,
    },
}

/// A prepared transaction as written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Branch identifier
    pub xid: Xid,
    /// Staged operations in submission order
    pub operations: Vec<TransactionOpRecord>,
}

/// Maps a signed paging order onto an unsigned key with the same ordering.
#[must_use]
pub fn order_key(order: i64) -> u64 {
    (order as u64) ^ (1 << 63)
}

/// Inverse of [`order_key`].
#[must_use]
pub fn key_order(key: u64) -> i64 {
    (key ^ (1 << 63)) as i64
}

fn paging_db(channel: &str) -> String {
    format!("paging.{channel}")
}

fn references_db(channel: &str) -> String {
    format!("refs.{channel}")
}

/// Broker-facing persistence API over an [`Environment`].
#[derive(Clone)]
pub struct PersistenceManager {
    env: Arc<dyn Environment>,
}

impl PersistenceManager {
    /// Wrap an environment.
    #[must_use]
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env }
    }

    /// The underlying environment.
    #[must_use]
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    // ---- paging -------------------------------------------------------

    /// Write `records` at consecutive paging orders starting at `first_order`,
    /// atomically.
    pub fn page_references(
        &self,
        channel: &str,
        first_order: i64,
        records: &[ReferenceRecord],
    ) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let db = self.env.database(&paging_db(channel))?;
        let tx = self.env.begin()?;
        let written = records.iter().zip(first_order..).try_for_each(
            |(record, order)| -> StorageResult<()> {
                let bytes = bincode::serialize(record)?;
                db.put(Some(&tx), order_key(order), &bytes, 0, bytes.len())
            },
        );
        self.finish_local(&tx, written)?;
        trace!(channel, first_order, count = records.len(), "Paged references");
        Ok(())
    }

    /// Remove and return up to `count` of the oldest paged references.
    pub fn load_paged_references(
        &self,
        channel: &str,
        count: usize,
    ) -> StorageResult<Vec<(i64, ReferenceRecord)>> {
        let db = self.env.database(&paging_db(channel))?;
        let loaded = decode_all(db.scan_first(count)?)?;
        if loaded.is_empty() {
            return Ok(loaded);
        }
        let tx = self.env.begin()?;
        let removed = loaded.iter().try_for_each(|(order, _)| db.remove(Some(&tx), order_key(*order)));
        self.finish_local(&tx, removed)?;
        trace!(channel, count = loaded.len(), "Loaded paged references");
        Ok(loaded)
    }

    /// Every paged reference of `channel`, oldest first, without removing them.
    pub fn paged_references(&self, channel: &str) -> StorageResult<Vec<(i64, ReferenceRecord)>> {
        decode_all(self.env.database(&paging_db(channel))?.scan()?)
    }

    /// Remove the paged references at `orders`.
    pub fn remove_paged_references(&self, channel: &str, orders: &[i64]) -> StorageResult<()> {
        let db = self.env.database(&paging_db(channel))?;
        orders.iter().try_for_each(|order| db.remove(None, order_key(*order)))
    }

    /// Number of paged references of `channel`.
    pub fn paged_count(&self, channel: &str) -> StorageResult<usize> {
        self.env.database(&paging_db(channel))?.size()
    }

    // ---- reliable references ------------------------------------------

    /// Durably record a reliable reference, optionally inside `tx`.
    pub fn add_reference(
        &self,
        channel: &str,
        record: &ReferenceRecord,
        tx: Option<&TxHandle>,
    ) -> StorageResult<()> {
        let db = self.env.database(&references_db(channel))?;
        let bytes = bincode::serialize(record)?;
        db.put(tx, record.sequence, &bytes, 0, bytes.len())
    }

    /// Remove a reliable reference, optionally inside `tx`.
    pub fn remove_reference(
        &self,
        channel: &str,
        sequence: u64,
        tx: Option<&TxHandle>,
    ) -> StorageResult<()> {
        self.env.database(&references_db(channel))?.remove(tx, sequence)
    }

    /// Committed reliable references of `channel` in FIFO order.
    pub fn reliable_references(&self, channel: &str) -> StorageResult<Vec<ReferenceRecord>> {
        let mut records = self
            .env
            .database(&references_db(channel))?
            .scan()?
            .into_iter()
            .map(|(_, bytes)| -> StorageResult<ReferenceRecord> { Ok(bincode::deserialize(&bytes)?) })
            .collect::<StorageResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.order);
        Ok(records)
    }

    /// Drop every record belonging to `channel`.
    pub fn drop_channel(&self, channel: &str) -> StorageResult<()> {
        self.env.drop_database(&paging_db(channel))?;
        self.env.drop_database(&references_db(channel))?;
        debug!(channel, "Dropped channel storage");
        Ok(())
    }

    // ---- transaction records ------------------------------------------

    /// Record a prepared transaction under `id`.
    pub fn put_transaction_record(&self, id: u64, record: &TransactionRecord) -> StorageResult<()> {
        let db = self.env.database(TRANSACTIONS_DB)?;
        let bytes = bincode::serialize(record)?;
        db.put(None, id, &bytes, 0, bytes.len())
    }

    /// Forget the transaction record under `id`.
    pub fn remove_transaction_record(&self, id: u64) -> StorageResult<()> {
        self.env.database(TRANSACTIONS_DB)?.remove(None, id)
    }

    /// Every stored transaction record with its id.
    pub fn transaction_records(&self) -> StorageResult<Vec<(u64, TransactionRecord)>> {
        self.env
            .database(TRANSACTIONS_DB)?
            .scan()?
            .into_iter()
            .map(|(id, bytes)| -> StorageResult<(u64, TransactionRecord)> {
                Ok((id, bincode::deserialize(&bytes)?))
            })
            .collect()
    }

    // ---- transactions -------------------------------------------------

    /// Begin a local storage transaction.
    pub fn begin(&self) -> StorageResult<TxHandle> {
        self.env.begin()
    }

    /// Commit a local storage transaction.
    pub fn commit_local(&self, tx: &TxHandle) -> StorageResult<()> {
        self.env.commit_local(tx)
    }

    /// Roll back a local storage transaction.
    pub fn rollback_local(&self, tx: &TxHandle) -> StorageResult<()> {
        self.env.rollback_local(tx)
    }

    /// See [`Environment::start_work`].
    pub fn start_work(&self, xid: &Xid) -> StorageResult<TxHandle> {
        self.env.start_work(xid)
    }

    /// See [`Environment::end_work`].
    pub fn end_work(&self, xid: &Xid, failed: bool) -> StorageResult<()> {
        self.env.end_work(xid, failed)
    }

    /// See [`Environment::prepare`].
    pub fn prepare(&self, xid: &Xid) -> StorageResult<()> {
        self.env.prepare(xid)
    }

    /// See [`Environment::commit`].
    pub fn commit(&self, xid: &Xid) -> StorageResult<()> {
        self.env.commit(xid)
    }

    /// See [`Environment::rollback`].
    pub fn rollback(&self, xid: &Xid) -> StorageResult<()> {
        self.env.rollback(xid)
    }

    /// See [`Environment::in_doubt_xids`].
    pub fn in_doubt_xids(&self) -> StorageResult<Vec<Xid>> {
        self.env.in_doubt_xids()
    }

    fn finish_local(&self, tx: &TxHandle, outcome: StorageResult<()>) -> StorageResult<()> {
        match outcome {
            Ok(()) => self.env.commit_local(tx),
            Err(err) => {
                // The original error matters more than a failed rollback
                let _ = self.env.rollback_local(tx);
                Err(err)
            },
        }
    }
}

fn decode_all(raw: Vec<(u64, Vec<u8>)>) -> StorageResult<Vec<(i64, ReferenceRecord)>> {
    raw.into_iter()
        .map(|(key, bytes)| -> StorageResult<(i64, ReferenceRecord)> {
            Ok((key_order(key), bincode::deserialize(&bytes)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryEnvironment;
    use bytes::Bytes;
    use courier_core::Destination;

    fn record(sequence: u64) -> ReferenceRecord {
        let message = Message::new(Destination::queue("q").unwrap(), Bytes::from(sequence.to_string()));
        ReferenceRecord { sequence, order: sequence, delivery_count: 0, message }
    }

    fn manager() -> (MemoryEnvironment, PersistenceManager) {
        let env = MemoryEnvironment::new();
        let pm = PersistenceManager::new(Arc::new(env.clone()));
        (env, pm)
    }

    #[test]
    fn test_order_key_preserves_ordering() {
        let orders = [-5i64, -1, 0, 1, 1_000];
        let keys: Vec<u64> = orders.iter().map(|o| order_key(*o)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(orders.iter().all(|o| key_order(order_key(*o)) == *o));
    }

    #[test]
    fn test_page_and_load_fifo() {
        let (_env, pm) = manager();
        let records: Vec<_> = (0..5).map(record).collect();
        pm.page_references("queue.q", 0, &records).unwrap();
        // Pushed in front of the existing sequence
        pm.page_references("queue.q", -2, &[record(100), record(101)]).unwrap();
        assert_eq!(pm.paged_count("queue.q").unwrap(), 7);

        let loaded = pm.load_paged_references("queue.q", 3).unwrap();
        let sequences: Vec<u64> = loaded.iter().map(|(_, r)| r.sequence).collect();
        assert_eq!(sequences, vec![100, 101, 0]);
        assert_eq!(pm.paged_count("queue.q").unwrap(), 4);
    }

    #[test]
    fn test_failed_page_write_leaves_nothing_behind() {
        let (env, pm) = manager();
        env.fail_writes(true);
        assert!(pm.page_references("queue.q", 0, &[record(1)]).is_err());
        env.fail_writes(false);
        assert_eq!(pm.paged_count("queue.q").unwrap(), 0);
    }

    #[test]
    fn test_reliable_references_survive_restart() {
        let (env, pm) = manager();
        pm.add_reference("queue.q", &record(2), None).unwrap();
        pm.add_reference("queue.q", &record(1), None).unwrap();
        env.restart().unwrap();
        let sequences: Vec<u64> =
            pm.reliable_references("queue.q").unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_reliable_references_follow_fifo_order() {
        let (_env, pm) = manager();
        pm.add_reference("queue.q", &ReferenceRecord { order: 9, ..record(0) }, None).unwrap();
        pm.add_reference("queue.q", &record(1), None).unwrap();
        pm.add_reference("queue.q", &record(2), None).unwrap();
        let sequences: Vec<u64> =
            pm.reliable_references("queue.q").unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 0]);
    }

    #[test]
    fn test_transaction_records_roundtrip() {
        let (_env, pm) = manager();
        let xid = Xid::new(1, vec![1], vec![]);
        let rec = TransactionRecord {
            xid: xid.clone(),
            operations: vec![TransactionOpRecord::Acknowledge {
                channel: "queue.q".into(),
                message_id: MessageId::new(),
                sequence: 4,
            }],
        };
        pm.put_transaction_record(9, &rec).unwrap();
        assert_eq!(pm.transaction_records().unwrap(), vec![(9, rec)]);
        pm.remove_transaction_record(9).unwrap();
        assert!(pm.transaction_records().unwrap().is_empty());
    }
}
