//! Sequence-ordered release of asynchronously decoded chunks.
//!
//! Inbound audio is decoded concurrently, so results can complete out of
//! order. Each chunk carries the sequence number it was assigned on arrival;
//! the buffer holds early results until every predecessor has been released.
//! A failed decode still occupies its slot (as `None` upstream) so ordering
//! never stalls on it.

use std::collections::BTreeMap;
use tracing::warn;

/// Holds out-of-order items until they can be released in sequence.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
    max_pending: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Accept the item with sequence number `seq`.
    ///
    /// Items older than what has already been released are dropped and
    /// returned as `false`.
    pub fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next {
            return false;
        }
        self.pending.insert(seq, item);

        // A slot that never completes must not hold playback forever
        if self.pending.len() > self.max_pending && !self.pending.contains_key(&self.next) {
            if let Some(&oldest) = self.pending.keys().next() {
                warn!(
                    skipped_from = self.next,
                    skipped_to = oldest,
                    "Reorder buffer full; skipping missing chunks"
                );
                self.next = oldest;
            }
        }
        true
    }

    /// Release every item that is now contiguous with what was released before.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Sequence number expected next.
    #[cfg(test)]
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything held and continue from `next`.
    pub fn reset(&mut self, next: u64) {
        self.pending.clear();
        self.next = next;
    }
}
