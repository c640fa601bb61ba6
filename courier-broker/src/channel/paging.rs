//! The bounded in-memory window and its spill path.
//!
//! The window holds the head of the FIFO. Once it is full, newer references
//! collect in the down-cache, which is written to storage in batches of
//! `down_cache_size`. Paged references are ordered by a signed paging order:
//! tail writes use `next_paging_order`, references pushed out of the window
//! by a cancellation are written in front of `first_paging_order`. Loading
//! always takes the lowest orders first.

use super::ChannelInner;
use crate::store::MessageReference;
use courier_core::Result;
use std::collections::VecDeque;
use tracing::{debug, error, trace, warn};

#[derive(Default)]
pub(super) struct PagingState {
    pub(super) window: VecDeque<MessageReference>,
    pub(super) down_cache: VecDeque<MessageReference>,
    pub(super) paged: usize,
    pub(super) first_paging_order: i64,
    pub(super) next_paging_order: i64,
}

impl PagingState {
    /// References exist beyond the window.
    pub(super) fn is_paging(&self) -> bool {
        self.paged > 0 || !self.down_cache.is_empty()
    }

    /// Append a newly visible reference at the tail of the FIFO.
    ///
    /// With `strict`, a failed flush removes `reference` again and reports the
    /// error; otherwise the reference stays buffered for the next flush.
    pub(super) fn add_last(
        &mut self,
        inner: &ChannelInner,
        reference: MessageReference,
        strict: bool,
    ) -> Result<()> {
        let paging = inner.config.paging;
        if !self.is_paging() && self.window.len() < paging.full_size {
            self.window.push_back(reference);
            return Ok(());
        }

        self.down_cache.push_back(reference);
        if self.down_cache.len() < paging.down_cache_size {
            return Ok(());
        }
        match self.flush_down_cache(inner) {
            Ok(_) => Ok(()),
            Err(err) if strict => {
                self.down_cache.pop_back();
                Err(err)
            },
            Err(err) => {
                error!(channel = %inner.name, %err, "Down-cache flush failed, references stay buffered");
                Ok(())
            },
        }
    }

    /// Write the down-cache to the tail of the paged sequence.
    pub(super) fn flush_down_cache(&mut self, inner: &ChannelInner) -> Result<usize> {
        if self.down_cache.is_empty() {
            return Ok(0);
        }
        if self.paged == 0 {
            self.first_paging_order = 0;
            self.next_paging_order = 0;
        }
        let records: Vec<_> = self.down_cache.iter().map(MessageReference::to_record).collect();
        inner.pm.page_references(&inner.name, self.next_paging_order, &records)?;

        let count = records.len();
        self.next_paging_order += count as i64;
        self.paged += count;
        self.down_cache.clear();
        debug!(channel = %inner.name, count, paged = self.paged, "Flushed down-cache");
        Ok(count)
    }

    /// Refill the window from beyond it while there is room for a batch.
    ///
    /// A batch is `min(page_size, references beyond the window)`.
    pub(super) fn load(&mut self, inner: &ChannelInner) -> Result<usize> {
        let paging = inner.config.paging;
        let mut moved = 0;

        while self.is_paging() {
            let room = paging.full_size.saturating_sub(self.window.len());
            let batch = paging.page_size.min(self.paged + self.down_cache.len());
            if batch == 0 || room < batch {
                break;
            }

            if self.paged == 0 {
                let count = room.min(self.down_cache.len());
                self.window.extend(self.down_cache.drain(..count));
                moved += count;
                trace!(channel = %inner.name, count, "Moved down-cache into window");
                continue;
            }

            self.flush_down_cache(inner)?;
            let records = inner.pm.load_paged_references(&inner.name, paging.page_size.min(room))?;
            if records.is_empty() {
                warn!(channel = %inner.name, expected = self.paged, "Paged references missing from storage");
                self.paged = 0;
                break;
            }

            let count = records.len();
            self.paged -= count.min(self.paged);
            if let Some((order, _)) = records.last() {
                self.first_paging_order = order + 1;
            }
            if self.paged == 0 {
                self.first_paging_order = 0;
                self.next_paging_order = 0;
            }
            for (_, record) in records {
                let mut reference = inner.store.reference_from_record(record);
                reference.attach(inner.id);
                self.window.push_back(reference);
            }
            moved += count;
            debug!(channel = %inner.name, count, paged = self.paged, "Loaded paged references");
        }

        Ok(moved)
    }

    /// Put a cancelled reference back where it would be had it never left.
    pub(super) fn insert_sorted(&mut self, reference: MessageReference) {
        let position = self.window.partition_point(|r| r.order() < reference.order());
        self.window.insert(position, reference);
    }

    /// Push references beyond `full_size` out to the front of storage.
    pub(super) fn spill_overflow(&mut self, inner: &ChannelInner) -> Result<()> {
        let full_size = inner.config.paging.full_size;
        if self.window.len() <= full_size {
            return Ok(());
        }

        let overflow: Vec<MessageReference> = self.window.drain(full_size..).collect();
        let records: Vec<_> = overflow.iter().map(MessageReference::to_record).collect();
        if self.paged == 0 {
            self.first_paging_order = 0;
            self.next_paging_order = 0;
        }
        let first = self.first_paging_order - records.len() as i64;
        match inner.pm.page_references(&inner.name, first, &records) {
            Ok(()) => {
                self.first_paging_order = first;
                self.paged += records.len();
                debug!(channel = %inner.name, count = records.len(), "Spilled window overflow to storage");
                Ok(())
            },
            Err(err) => {
                self.window.extend(overflow);
                Err(err.into())
            },
        }
    }

    /// Drop every undelivered reference held in memory.
    pub(super) fn clear_memory(&mut self) -> Vec<MessageReference> {
        self.window.drain(..).chain(self.down_cache.drain(..)).collect()
    }
}
