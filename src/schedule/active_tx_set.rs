use std::sync::atomic::AtomicU8;

use crate::cbf::CountingBloomFilter;
use crate::tx_entry::TxEntry;

const ACTIVE_CBF_SIZE: usize = 65536;
const ACTIVE_CBF_LIMIT: u32 = u8::MAX as u32;

/// Approximate membership set of the CIs currently undergoing validation.
///
/// Instead of fine-grained tuple locks, the keys of every in-flight CI are
/// counted in a Bloom filter; a CI whose keys intersect the filter is held
/// back. False positives only delay a CI, false negatives cannot occur.
/// The serializer is the single incrementer; conclusion paths decrement.
pub struct ActiveTxSet {
    cbf: CountingBloomFilter<AtomicU8>,
}

impl ActiveTxSet {
    pub fn new() -> Self {
        Self {
            cbf: CountingBloomFilter::new(ACTIVE_CBF_SIZE, ACTIVE_CBF_LIMIT),
        }
    }

    /// Inserts every key of the CI's read and write sets. On counter
    /// overflow the partial insert is reverted and `false` is returned.
    pub fn add(&self, tx: &TxEntry) -> bool {
        let mut done: Vec<&[u8]> = Vec::with_capacity(tx.write_set.len() + tx.read_set.len());
        for key in tx.keys() {
            if !self.cbf.add(key) {
                for k in done {
                    self.cbf.remove(k);
                }
                return false;
            }
            done.push(key);
        }
        true
    }

    /// Undoes a prior successful `add`.
    pub fn remove(&self, tx: &TxEntry) {
        for key in tx.keys() {
            self.cbf.remove(key);
        }
    }

    /// True iff any of the CI's keys may belong to an already-active CI.
    pub fn blocks(&self, tx: &TxEntry) -> bool {
        tx.keys().any(|key| self.cbf.contains(key))
    }
}

impl Default for ActiveTxSet {
    fn default() -> Self {
        Self::new()
    }
}
