//! # Channels
//!
//! A channel is the ordered, transactional, pageable holder of message
//! references behind a queue or a topic subscription. It hands references to
//! its receivers in FIFO order, tracks them while in flight, and keeps memory
//! bounded by paging anything beyond its window to storage.
//!
//! Lock order: a channel lock may be held while a transaction lock is taken,
//! never the other way round.

mod paging;

use crate::{
    delivery::Delivery,
    receiver::{Offer, Receiver},
    selector::Filter,
    store::{MessageReference, MessageStore},
    transaction::Transaction,
};
use chrono::{DateTime, Utc};
use courier_core::{
    types::{ChannelId, ConsumerId},
    Error, Message, MessageId, PagingConfig, Result,
};
use courier_storage::PersistenceManager;
use paging::PagingState;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, trace, warn};

/// Receiver id used for acknowledgements restored by transaction recovery.
pub(crate) const RECOVERY_RECEIVER: ConsumerId = ConsumerId::new(0);

/// Static channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Window and paging sizes
    pub paging: PagingConfig,
    /// Whether persistent references survive a restart
    pub recoverable: bool,
}

impl ChannelConfig {
    /// Create a channel configuration.
    #[must_use]
    pub const fn new(paging: PagingConfig, recoverable: bool) -> Self {
        Self { paging, recoverable }
    }
}

/// Point-in-time channel counters.
///
/// `memory_refs + down_cache + paged + delivering` is the number of
/// references the channel is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCounts {
    /// References in the in-memory window
    pub memory_refs: usize,
    /// References buffered for the next paging write
    pub down_cache: usize,
    /// References held only in storage
    pub paged: usize,
    /// References delivered and not yet acknowledged
    pub delivering: usize,
}

impl ChannelCounts {
    /// Every reference the channel holds.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.memory_refs + self.down_cache + self.paged + self.delivering
    }

    /// References waiting for delivery.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.memory_refs + self.down_cache + self.paged
    }
}

struct InFlight {
    reference: MessageReference,
    receiver_id: ConsumerId,
    done: Arc<AtomicBool>,
    tx_pending: bool,
}

#[derive(Default)]
struct ChannelState {
    paging: PagingState,
    in_flight: HashMap<MessageId, InFlight>,
    receivers: Vec<Arc<dyn Receiver>>,
    next_receiver: usize,
    next_sequence: u64,
    wake_at: Option<DateTime<Utc>>,
    closed: bool,
}

struct ChannelInner {
    id: ChannelId,
    name: String,
    config: ChannelConfig,
    store: MessageStore,
    pm: PersistenceManager,
    state: Mutex<ChannelState>,
}

/// Ordered, pageable reference holder behind a queue or subscription.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create an empty channel.
    ///
    /// # Errors
    /// `Configuration` when the paging sizes are out of bounds.
    pub fn new(
        id: ChannelId,
        name: impl Into<String>,
        config: ChannelConfig,
        store: MessageStore,
        pm: PersistenceManager,
    ) -> Result<Self> {
        config.paging.check_bounds()?;
        Ok(Self {
            inner: Arc::new(ChannelInner {
                id,
                name: name.into(),
                config,
                store,
                pm,
                state: Mutex::new(ChannelState::default()),
            }),
        })
    }

    /// Channel id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Storage name of the channel.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Channel settings.
    #[must_use]
    pub fn config(&self) -> ChannelConfig {
        self.inner.config
    }

    /// Whether persistent references survive a restart.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.inner.config.recoverable
    }

    /// Whether `reference` is written to the reliable reference log.
    pub(crate) fn persists(&self, reference: &MessageReference) -> bool {
        self.inner.config.recoverable && reference.is_persistent()
    }

    pub(crate) fn persistence(&self) -> &PersistenceManager {
        &self.inner.pm
    }

    // ---- receivers -----------------------------------------------------

    /// Attach a receiver and try to deliver to it.
    ///
    /// # Errors
    /// `IllegalState` on a closed channel, `Storage` when reloading paged
    /// references fails.
    pub fn add_receiver(&self, receiver: Arc<dyn Receiver>) -> Result<()> {
        let mut state = self.lock_open()?;
        debug!(channel = %self.inner.name, receiver = %receiver.receiver_id(), "Added receiver");
        state.receivers.push(receiver);
        self.pump(&mut state).map(drop)
    }

    /// Detach a receiver. Its in-flight deliveries stay outstanding.
    pub fn remove_receiver(&self, receiver_id: ConsumerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.receivers.len();
        state.receivers.retain(|r| r.receiver_id() != receiver_id);
        let removed = state.receivers.len() != before;
        if removed {
            state.next_receiver = 0;
        }
        removed
    }

    /// Number of attached receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.inner.state.lock().receivers.len()
    }

    // ---- routing -------------------------------------------------------

    /// Accept a reference into the channel.
    ///
    /// Without a transaction the reference becomes visible immediately and
    /// the delivery it produced, if any, is returned. With a transaction it
    /// is staged and becomes visible on commit.
    ///
    /// # Errors
    /// `IllegalState` on a closed channel or an inactive transaction,
    /// `Storage` when the reference cannot be recorded. A failed reference is
    /// not left in the channel.
    pub fn handle(
        &self,
        mut reference: MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<Option<Delivery>> {
        let mut state = self.lock_open()?;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        reference.bind(self.inner.id, sequence);

        if let Some(tx) = tx {
            tx.add_enqueue(self.clone(), reference)?;
            return Ok(None);
        }

        let durable = self.persists(&reference);
        if durable {
            self.inner.pm.add_reference(&self.inner.name, &reference.to_record(), None)?;
        }
        if let Err(err) = state.paging.add_last(&self.inner, reference, true) {
            if durable {
                if let Err(undo) = self.inner.pm.remove_reference(&self.inner.name, sequence, None) {
                    error!(channel = %self.inner.name, sequence, %undo, "Failed to undo reliable reference");
                }
            }
            return Err(err);
        }

        let delivered = self.pump_logged(&mut state);
        Ok(delivered.into_iter().find(|d| d.sequence() == sequence))
    }

    /// Try to deliver waiting references to the attached receivers.
    ///
    /// # Errors
    /// `Storage` when reloading paged references fails.
    pub fn deliver(&self) -> Result<Vec<Delivery>> {
        let mut state = self.inner.state.lock();
        self.pump(&mut state)
    }

    // ---- acknowledgement and cancellation ------------------------------

    pub(crate) fn acknowledge_delivery(
        &self,
        delivery: &Delivery,
        tx: Option<&Transaction>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        let id = delivery.message_id();
        let entry = state
            .in_flight
            .get_mut(&id)
            .filter(|entry| entry.receiver_id == delivery.receiver_id())
            .ok_or_else(|| Error::illegal_state(format!("{id} is not being delivered to {}", delivery.receiver_id())))?;
        if entry.tx_pending {
            return Err(Error::illegal_state(format!("{id} is already acknowledged in a transaction")));
        }

        if let Some(tx) = tx {
            tx.add_acknowledge(
                self.clone(),
                id,
                entry.reference.sequence(),
                entry.reference.is_persistent(),
            )?;
            entry.tx_pending = true;
            return Ok(());
        }

        if self.persists(&entry.reference) {
            self.inner.pm.remove_reference(&self.inner.name, entry.reference.sequence(), None)?;
        }
        if let Some(entry) = state.in_flight.remove(&id) {
            entry.done.store(true, Ordering::Release);
        }
        self.pump(&mut state).map(drop)
    }

    /// Acknowledge every outstanding delivery outside a transaction.
    ///
    /// # Errors
    /// `Storage` when a durable record cannot be removed; deliveries
    /// acknowledged before the failure stay acknowledged.
    pub fn acknowledge_all(&self) -> Result<usize> {
        let mut state = self.inner.state.lock();
        let mut ids: Vec<(u64, u64, MessageId)> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| !entry.tx_pending)
            .map(|(id, entry)| (entry.reference.order(), entry.reference.sequence(), *id))
            .collect();
        ids.sort_unstable();

        let mut acknowledged = 0;
        for (_, sequence, id) in ids {
            let durable = state.in_flight.get(&id).is_some_and(|e| self.persists(&e.reference));
            if durable {
                self.inner.pm.remove_reference(&self.inner.name, sequence, None)?;
            }
            if let Some(entry) = state.in_flight.remove(&id) {
                entry.done.store(true, Ordering::Release);
                acknowledged += 1;
            }
        }
        self.pump(&mut state)?;
        Ok(acknowledged)
    }

    pub(crate) fn cancel_delivery(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.inner.state.lock();
        let id = delivery.message_id();
        match state.in_flight.get(&id) {
            Some(entry) if entry.receiver_id == delivery.receiver_id() && !entry.tx_pending => {},
            Some(entry) if entry.tx_pending => {
                return Err(Error::illegal_state(format!("{id} is acknowledged in a pending transaction")));
            },
            _ => {
                return Err(Error::illegal_state(format!("{id} is not being delivered to {}", delivery.receiver_id())));
            },
        }
        self.requeue(&mut state, vec![id])?;
        self.pump(&mut state).map(drop)
    }

    /// Return every outstanding delivery to the channel.
    ///
    /// # Errors
    /// `Storage` when the window overflow cannot be paged.
    pub fn cancel_all_deliveries(&self) -> Result<usize> {
        self.cancel_matching(|_| true)
    }

    /// Return the outstanding deliveries of one receiver to the channel.
    ///
    /// # Errors
    /// `Storage` when the window overflow cannot be paged.
    pub fn cancel_deliveries_for(&self, receiver_id: ConsumerId) -> Result<usize> {
        self.cancel_matching(|entry| entry.receiver_id == receiver_id)
    }

    fn cancel_matching(&self, predicate: impl Fn(&InFlight) -> bool) -> Result<usize> {
        let mut state = self.inner.state.lock();
        let ids: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| !entry.tx_pending && predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        let count = ids.len();
        if count > 0 {
            self.requeue(&mut state, ids)?;
            self.pump(&mut state)?;
        }
        Ok(count)
    }

    /// Move in-flight entries back into the window in FIFO order.
    fn requeue(&self, state: &mut ChannelState, ids: Vec<MessageId>) -> Result<()> {
        for id in ids {
            if let Some(entry) = state.in_flight.remove(&id) {
                entry.done.store(true, Ordering::Release);
                state.paging.insert_sorted(entry.reference);
            }
        }
        if let Err(err) = state.paging.spill_overflow(&self.inner) {
            warn!(channel = %self.inner.name, %err, "Window overflow after cancellation could not be paged");
            return Err(err);
        }
        Ok(())
    }

    /// Hand the reference for `message_id` to `receiver_id`.
    ///
    /// An in-flight reference is re-attributed and earlier delivery handles
    /// become stale; an undelivered reference in memory is taken out of the
    /// window or down-cache.
    ///
    /// # Errors
    /// `IllegalState` when the channel holds no such reference in memory or
    /// it is acknowledged in a pending transaction.
    pub fn claim(&self, message_id: MessageId, receiver_id: ConsumerId) -> Result<Delivery> {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.in_flight.get_mut(&message_id) {
            if entry.tx_pending {
                return Err(Error::illegal_state(format!("{message_id} is acknowledged in a pending transaction")));
            }
            let delivery = Delivery::new(
                self.clone(),
                Arc::clone(entry.reference.message()),
                entry.reference.sequence(),
                receiver_id,
                entry.reference.delivery_count(),
            );
            entry.done.store(true, Ordering::Release);
            entry.done = delivery.done_flag();
            entry.receiver_id = receiver_id;
            return Ok(delivery);
        }

        let mut reference = Self::take_undelivered(&mut state, message_id)
            .ok_or_else(|| Error::illegal_state(format!("{message_id} is not held by channel {}", self.inner.name)))?;
        reference.increment_delivery_count();
        let delivery = Delivery::new(
            self.clone(),
            Arc::clone(reference.message()),
            reference.sequence(),
            receiver_id,
            reference.delivery_count(),
        );
        state.in_flight.insert(
            message_id,
            InFlight { reference, receiver_id, done: delivery.done_flag(), tx_pending: false },
        );
        self.pump_logged(&mut state);
        Ok(delivery)
    }

    fn take_undelivered(state: &mut ChannelState, message_id: MessageId) -> Option<MessageReference> {
        let paging = &mut state.paging;
        if let Some(position) = paging.window.iter().position(|r| r.message_id() == message_id) {
            return paging.window.remove(position);
        }
        let position = paging.down_cache.iter().position(|r| r.message_id() == message_id)?;
        paging.down_cache.remove(position)
    }

    // ---- inspection ----------------------------------------------------

    /// Snapshot of the undelivered messages, oldest first.
    ///
    /// # Errors
    /// `Storage` when paged references cannot be read.
    pub fn browse(&self, filter: Option<&dyn Filter>) -> Result<Vec<Arc<Message>>> {
        let state = self.inner.state.lock();
        let mut messages: Vec<Arc<Message>> =
            state.paging.window.iter().map(|r| Arc::clone(r.message())).collect();
        if state.paging.paged > 0 {
            let paged = self.inner.pm.paged_references(&self.inner.name)?;
            messages.extend(paged.into_iter().map(|(_, record)| Arc::new(record.message)));
        }
        messages.extend(state.paging.down_cache.iter().map(|r| Arc::clone(r.message())));
        if let Some(filter) = filter {
            messages.retain(|message| filter.matches(message));
        }
        Ok(messages)
    }

    /// Current counters.
    #[must_use]
    pub fn counts(&self) -> ChannelCounts {
        let state = self.inner.state.lock();
        ChannelCounts {
            memory_refs: state.paging.window.len(),
            down_cache: state.paging.down_cache.len(),
            paged: state.paging.paged,
            delivering: state.in_flight.len(),
        }
    }

    /// Every reference the channel holds.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.counts().message_count()
    }

    /// References in the in-memory window.
    #[must_use]
    pub fn memory_ref_count(&self) -> usize {
        self.inner.state.lock().paging.window.len()
    }

    /// References buffered for the next paging write.
    #[must_use]
    pub fn down_cache_count(&self) -> usize {
        self.inner.state.lock().paging.down_cache.len()
    }

    /// References held only in storage.
    #[must_use]
    pub fn paged_count(&self) -> usize {
        self.inner.state.lock().paging.paged
    }

    /// References delivered and not yet acknowledged.
    #[must_use]
    pub fn delivering_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Whether references exist beyond the window.
    #[must_use]
    pub fn is_paging(&self) -> bool {
        self.inner.state.lock().paging.is_paging()
    }

    // ---- lifecycle -----------------------------------------------------

    /// Delete every undelivered reference, in memory and in storage.
    ///
    /// # Errors
    /// `Storage` when records cannot be removed; memory is left untouched
    /// in that case.
    pub fn remove_all_references(&self) -> Result<usize> {
        let mut state = self.inner.state.lock();
        let inner = &self.inner;
        let paged = if state.paging.paged > 0 {
            inner.pm.paged_references(&inner.name)?
        } else {
            Vec::new()
        };

        let durable: Vec<u64> = state
            .paging
            .window
            .iter()
            .chain(state.paging.down_cache.iter())
            .filter(|r| self.persists(r))
            .map(MessageReference::sequence)
            .chain(
                paged
                    .iter()
                    .filter(|(_, record)| inner.config.recoverable && record.message.persistent)
                    .map(|(_, record)| record.sequence),
            )
            .collect();
        for sequence in durable {
            inner.pm.remove_reference(&inner.name, sequence, None)?;
        }
        let orders: Vec<i64> = paged.iter().map(|(order, _)| *order).collect();
        inner.pm.remove_paged_references(&inner.name, &orders)?;

        let removed = state.paging.clear_memory().len() + paged.len();
        state.paging.paged = 0;
        state.paging.first_paging_order = 0;
        state.paging.next_paging_order = 0;
        debug!(channel = %inner.name, removed, "Removed all references");
        Ok(removed)
    }

    /// Rebuild the channel from storage after a restart.
    ///
    /// Non-persistent paged references are discarded. Reliable references
    /// older than the oldest paged one go to the window, newer ones to the
    /// tail.
    ///
    /// # Errors
    /// `Storage` when records cannot be read.
    pub fn recover(&self) -> Result<usize> {
        let mut state = self.lock_open()?;
        let inner = &self.inner;
        if !inner.config.recoverable {
            return Ok(0);
        }

        let (paged, transient): (Vec<_>, Vec<_>) = inner
            .pm
            .paged_references(&inner.name)?
            .into_iter()
            .partition(|(_, record)| record.message.persistent);
        if !transient.is_empty() {
            let orders: Vec<i64> = transient.iter().map(|(order, _)| *order).collect();
            inner.pm.remove_paged_references(&inner.name, &orders)?;
            debug!(channel = %inner.name, count = orders.len(), "Discarded non-persistent paged references");
        }

        let paged_sequences: HashSet<u64> = paged.iter().map(|(_, record)| record.sequence).collect();
        let oldest_paged = paged.iter().map(|(_, record)| record.order).min();
        let mut max_sequence = paged.iter().map(|(_, record)| record.sequence.max(record.order)).max();
        state.paging.paged = paged.len();
        state.paging.first_paging_order = paged.first().map_or(0, |(order, _)| *order);
        state.paging.next_paging_order = paged.last().map_or(0, |(order, _)| order + 1);

        let mut restored = paged.len();
        for record in inner.pm.reliable_references(&inner.name)? {
            max_sequence = max_sequence.max(Some(record.sequence.max(record.order)));
            if paged_sequences.contains(&record.sequence) {
                continue;
            }
            let mut reference = inner.store.reference_from_record(record);
            reference.attach(inner.id);
            if oldest_paged.is_some_and(|oldest| reference.order() > oldest) {
                state.paging.add_last(inner, reference, false)?;
            } else {
                state.paging.window.push_back(reference);
            }
            restored += 1;
        }

        if let Some(max_sequence) = max_sequence {
            state.next_sequence = state.next_sequence.max(max_sequence + 1);
        }
        state.paging.spill_overflow(inner)?;
        info!(channel = %inner.name, restored, paged = state.paging.paged, "Recovered channel");
        self.pump_logged(&mut state);
        Ok(restored)
    }

    /// Close the channel and drop its storage.
    ///
    /// # Errors
    /// `IllegalState` while references are outstanding, `Storage` when the
    /// channel's records cannot be dropped.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.in_flight.is_empty() {
            return Err(Error::illegal_state(format!(
                "channel {} has {} deliveries outstanding",
                self.inner.name,
                state.in_flight.len()
            )));
        }
        state.closed = true;
        state.receivers.clear();
        drop(state.paging.clear_memory());
        state.paging.paged = 0;
        self.inner.pm.drop_channel(&self.inner.name)?;
        debug!(channel = %self.inner.name, "Closed channel");
        Ok(())
    }

    // ---- transaction hooks ---------------------------------------------

    pub(crate) fn reserve_sequence(&self, sequence: u64) {
        let mut state = self.inner.state.lock();
        state.next_sequence = state.next_sequence.max(sequence + 1);
    }

    /// Make a committed enqueue visible at the tail of the FIFO.
    ///
    /// The reference keeps the sequence its reliable record is stored under
    /// and takes its FIFO position now.
    pub(crate) fn commit_enqueue(&self, mut reference: MessageReference) {
        let mut state = self.inner.state.lock();
        if state.closed {
            warn!(channel = %self.inner.name, "Dropping committed reference for closed channel");
            return;
        }
        let order = state.next_sequence;
        state.next_sequence += 1;
        reference.set_order(order);
        if self.persists(&reference) {
            if let Err(err) = self.inner.pm.add_reference(&self.inner.name, &reference.to_record(), None) {
                warn!(channel = %self.inner.name, order, %err, "Failed to record position of committed reference");
            }
        }
        if let Err(err) = state.paging.add_last(&self.inner, reference, false) {
            error!(channel = %self.inner.name, %err, "Failed to add committed reference");
        }
        self.pump_logged(&mut state);
    }

    pub(crate) fn commit_acknowledge(&self, message_id: MessageId) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.in_flight.remove(&message_id) {
            entry.done.store(true, Ordering::Release);
        }
        self.pump_logged(&mut state);
    }

    /// Undo a staged acknowledgement.
    ///
    /// The delivery stays outstanding with its receiver; deliveries restored
    /// by recovery have no receiver and return to the channel instead.
    pub(crate) fn rollback_acknowledge(&self, message_id: MessageId) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.in_flight.get_mut(&message_id) else {
            return;
        };
        entry.tx_pending = false;
        if entry.receiver_id != RECOVERY_RECEIVER {
            return;
        }
        if let Err(err) = self.requeue(&mut state, vec![message_id]) {
            error!(channel = %self.inner.name, %err, "Failed to requeue recovered reference");
        }
        self.pump_logged(&mut state);
    }

    /// Mark a reference restored by recovery as acknowledged inside a
    /// prepared transaction.
    pub(crate) fn restore_pending_acknowledge(&self, message_id: MessageId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let mut reference = match Self::take_undelivered(&mut state, message_id) {
            Some(reference) => reference,
            None => self.take_paged(&mut state, message_id)?,
        };
        reference.increment_delivery_count();
        state.in_flight.insert(
            message_id,
            InFlight {
                reference,
                receiver_id: RECOVERY_RECEIVER,
                done: Arc::new(AtomicBool::new(false)),
                tx_pending: true,
            },
        );
        Ok(())
    }

    fn take_paged(&self, state: &mut ChannelState, message_id: MessageId) -> Result<MessageReference> {
        let inner = &self.inner;
        let (order, record) = inner
            .pm
            .paged_references(&inner.name)?
            .into_iter()
            .find(|(_, record)| record.message.id == message_id)
            .ok_or_else(|| Error::illegal_state(format!("{message_id} is not held by channel {}", inner.name)))?;
        inner.pm.remove_paged_references(&inner.name, &[order])?;
        state.paging.paged = state.paging.paged.saturating_sub(1);
        let mut reference = inner.store.reference_from_record(record);
        reference.attach(inner.id);
        Ok(reference)
    }

    // ---- internals -----------------------------------------------------

    fn lock_open(&self) -> Result<MutexGuard<'_, ChannelState>> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(Error::illegal_state(format!("channel {} is closed", self.inner.name)));
        }
        Ok(state)
    }

    fn pump_logged(&self, state: &mut ChannelState) -> Vec<Delivery> {
        match self.pump(state) {
            Ok(delivered) => delivered,
            Err(err) => {
                error!(channel = %self.inner.name, %err, "Failed to refill window");
                Vec::new()
            },
        }
    }

    /// Deliver from the window, refilling it from beyond until nothing moves.
    fn pump(&self, state: &mut ChannelState) -> Result<Vec<Delivery>> {
        let mut delivered = Vec::new();
        let mut next_due: Option<DateTime<Utc>> = None;
        loop {
            if let Some(due) = self.deliver_window(state, &mut delivered) {
                next_due = Some(next_due.map_or(due, |earliest| earliest.min(due)));
            }
            let loaded = state.paging.load(&self.inner)?;
            if loaded == 0 || state.receivers.is_empty() {
                break;
            }
        }
        if let Some(due) = next_due {
            self.schedule_wakeup(state, due);
        }
        Ok(delivered)
    }

    /// Run delivery again once the earliest scheduled reference comes due.
    ///
    /// Needs a tokio runtime; without one the reference waits for the next
    /// channel activity.
    fn schedule_wakeup(&self, state: &mut ChannelState, due: DateTime<Utc>) {
        if state.wake_at.is_some_and(|armed| armed <= due) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(channel = %self.inner.name, %due, "No runtime to wake scheduled delivery");
            return;
        };
        state.wake_at = Some(due);
        let delay = (due - Utc::now()).to_std().unwrap_or_default();
        let channel = Arc::downgrade(&self.inner);
        trace!(channel = %self.inner.name, %due, "Armed scheduled delivery");
        runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::now() + delay).await;
            if let Some(inner) = channel.upgrade() {
                Channel { inner }.wake(due);
            }
        });
    }

    fn wake(&self, due: DateTime<Utc>) {
        let mut state = self.inner.state.lock();
        if state.wake_at == Some(due) {
            state.wake_at = None;
        }
        if state.closed {
            return;
        }
        let delivered = self.pump_logged(&mut state);
        if !delivered.is_empty() {
            debug!(channel = %self.inner.name, count = delivered.len(), "Delivered scheduled messages");
        }
    }

    /// Offer the window to the receivers. Returns the earliest delivery time
    /// of a scheduled reference that was skipped.
    fn deliver_window(&self, state: &mut ChannelState, out: &mut Vec<Delivery>) -> Option<DateTime<Utc>> {
        let count = state.receivers.len();
        if count == 0 {
            return None;
        }
        let now = Utc::now();
        let mut busy = vec![false; count];
        let mut index = 0;
        let mut next_due: Option<DateTime<Utc>> = None;

        while index < state.paging.window.len() && busy.iter().any(|b| !b) {
            let reference = &state.paging.window[index];
            if reference.message().is_expired_at(now) {
                if let Some(expired) = state.paging.window.remove(index) {
                    self.discard_expired(expired);
                }
                continue;
            }
            if let Some(at) = reference.message().scheduled_delivery.filter(|at| *at > now) {
                next_due = Some(next_due.map_or(at, |due| due.min(at)));
                index += 1;
                continue;
            }

            let mut accepted = None;
            for step in 0..count {
                let slot = (state.next_receiver + step) % count;
                if busy[slot] {
                    continue;
                }
                let receiver = &state.receivers[slot];
                let delivery = Delivery::new(
                    self.clone(),
                    Arc::clone(reference.message()),
                    reference.sequence(),
                    receiver.receiver_id(),
                    reference.delivery_count() + 1,
                );
                match receiver.offer(&delivery) {
                    Offer::Accepted => {
                        accepted = Some((slot, delivery));
                        break;
                    },
                    Offer::NotMatched => {},
                    Offer::Busy => busy[slot] = true,
                }
            }

            let Some((slot, delivery)) = accepted else {
                index += 1;
                continue;
            };
            state.next_receiver = (slot + 1) % count;
            if let Some(mut reference) = state.paging.window.remove(index) {
                reference.increment_delivery_count();
                state.in_flight.insert(
                    reference.message_id(),
                    InFlight {
                        reference,
                        receiver_id: delivery.receiver_id(),
                        done: delivery.done_flag(),
                        tx_pending: false,
                    },
                );
            }
            out.push(delivery);
        }
        next_due
    }

    fn discard_expired(&self, reference: MessageReference) {
        debug!(channel = %self.inner.name, message_id = %reference.message_id(), "Discarding expired message");
        if self.persists(&reference) {
            if let Err(err) = self.inner.pm.remove_reference(&self.inner.name, reference.sequence(), None) {
                error!(channel = %self.inner.name, %err, "Failed to remove expired reference");
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("counts", &self.counts())
            .finish()
    }
}
