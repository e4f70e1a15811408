use std::sync::atomic::{AtomicU32, AtomicU8};
use std::sync::Arc;

use crate::cbf::CountingBloomFilter;
use crate::schedule::active_tx_set::ActiveTxSet;
use crate::schedule::wait_list::WaitList;
use crate::tx_entry::TxEntry;

const HOT_CBF_LIMIT: u32 = 100_000;

/// Holds due cross-shard CIs and feeds them to the active-tx set.
///
/// CIs are classified by how deep a dependency chain they join, tracked by
/// three CBFs of increasing saturation: independent CIs dispatch in any
/// order, cold dependents wait for every earlier independent or cold CI,
/// and hot dependents (long chains) drain strictly last. Serializing the
/// hot chains keeps the validator from thrashing on aborts. One producer,
/// one consumer.
pub struct DistributedTxSet {
    independent_queue: WaitList,
    cold_queue: WaitList,
    hot_queue: WaitList,
    independent_cbf: CountingBloomFilter<AtomicU8>,
    cold_cbf: CountingBloomFilter<AtomicU8>,
    hot_cbf: CountingBloomFilter<AtomicU32>,
    hot_threshold: u32,
}

impl DistributedTxSet {
    pub fn new(
        queue_capacity: usize,
        independent_size: usize,
        cold_size: usize,
        hot_size: usize,
        hot_threshold: u32,
    ) -> Self {
        Self {
            independent_queue: WaitList::new(queue_capacity),
            cold_queue: WaitList::new(queue_capacity),
            hot_queue: WaitList::new(queue_capacity),
            independent_cbf: CountingBloomFilter::new(independent_size, u8::MAX as u32),
            cold_cbf: CountingBloomFilter::new(cold_size, u8::MAX as u32),
            hot_cbf: CountingBloomFilter::new(hot_size, HOT_CBF_LIMIT),
            hot_threshold,
        }
    }

    /// Classifies and enqueues a cross-shard CI. Returns `false` when the
    /// target queue or CBF is saturated; the caller keeps the CI and
    /// retries.
    pub fn add(&self, tx: Arc<TxEntry>) -> bool {
        let cold_count = tx
            .keys()
            .map(|k| self.cold_cbf.count(k))
            .max()
            .unwrap_or(0);
        let dependent = cold_count > 0
            || tx
                .keys()
                .any(|k| self.hot_cbf.contains(k) || self.independent_cbf.contains(k));

        if !dependent && self.add_keys(&self.independent_cbf, &tx) {
            if self.independent_queue.push(tx.clone()) {
                return true;
            }
            self.remove_keys(&self.independent_cbf, &tx);
            return false;
        }
        if dependent && cold_count < self.hot_threshold && self.add_keys(&self.cold_cbf, &tx) {
            if self.cold_queue.push(tx.clone()) {
                return true;
            }
            self.remove_keys(&self.cold_cbf, &tx);
            return false;
        }
        if self.add_keys(&self.hot_cbf, &tx) {
            if self.hot_queue.push(tx.clone()) {
                return true;
            }
            self.remove_keys(&self.hot_cbf, &tx);
        }
        false
    }

    /// The earliest CI dispatchable under the scheduling policy, removed
    /// from its sub-queue and CBF. Independent CIs may jump the queue; a
    /// cold CI goes only when no earlier CI remains ahead of it; a hot CI
    /// waits for both other queues to drain.
    pub fn find_ready_tx(&self, active: &ActiveTxSet) -> Option<Arc<TxEntry>> {
        if let Some(tx) = self.independent_queue.find_ready(|tx| !active.blocks(tx)) {
            self.independent_queue.remove(tx.cts());
            self.remove_keys(&self.independent_cbf, &tx);
            return Some(tx);
        }

        if let Some(tx) = self.cold_queue.find_ready(|_| true) {
            let earlier_independent = self
                .independent_queue
                .min_cts()
                .is_some_and(|m| m < tx.cts());
            if !earlier_independent && !active.blocks(&tx) {
                self.cold_queue.remove(tx.cts());
                self.remove_keys(&self.cold_cbf, &tx);
                return Some(tx);
            }
            return None;
        }

        if self.independent_queue.is_empty() && self.cold_queue.is_empty() {
            if let Some(tx) = self.hot_queue.find_ready(|_| true) {
                if !active.blocks(&tx) {
                    self.hot_queue.remove(tx.cts());
                    self.remove_keys(&self.hot_cbf, &tx);
                    return Some(tx);
                }
            }
        }
        None
    }

    /// Number of CIs currently queued across all three sub-queues.
    pub fn count(&self) -> usize {
        self.independent_queue.len() + self.cold_queue.len() + self.hot_queue.len()
    }

    /// Smallest CTS still queued, across the sub-queues.
    pub fn min_cts(&self) -> Option<crate::tx_entry::Ts> {
        [
            self.independent_queue.min_cts(),
            self.cold_queue.min_cts(),
            self.hot_queue.min_cts(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn add_keys<C: crate::cbf::Counter>(
        &self,
        cbf: &CountingBloomFilter<C>,
        tx: &TxEntry,
    ) -> bool {
        let mut done: Vec<&[u8]> = Vec::new();
        for key in tx.keys() {
            if !cbf.add(key) {
                for k in done {
                    cbf.remove(k);
                }
                return false;
            }
            done.push(key);
        }
        true
    }

    fn remove_keys<C: crate::cbf::Counter>(&self, cbf: &CountingBloomFilter<C>, tx: &TxEntry) {
        for key in tx.keys() {
            cbf.remove(key);
        }
    }
}
