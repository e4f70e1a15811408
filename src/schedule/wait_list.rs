use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tx_entry::{Ts, TxEntry};

/// Bounded reorder queue of commit intents, ordered by CTS per producer.
///
/// The consumer peeks entries without consuming them (`find_ready`) and
/// frees a slot only once the CI concludes (`remove`), so skipped entries
/// leave temporary holes; the head advances past freed slots. One producer,
/// one consumer.
pub struct WaitList {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    slots: VecDeque<Option<Arc<TxEntry>>>,
    live: usize,
}

impl WaitList {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity.min(1024)),
                live: 0,
            }),
            capacity,
        }
    }

    /// Appends a CI. Returns `false` when the list is full.
    pub fn push(&self, tx: Arc<TxEntry>) -> bool {
        let mut inner = self.inner.lock();
        if inner.live >= self.capacity {
            return false;
        }
        inner.slots.push_back(Some(tx));
        inner.live += 1;
        true
    }

    /// The earliest CI satisfying `pred`, without consuming it. Holes are
    /// skipped.
    pub fn find_ready<F>(&self, mut pred: F) -> Option<Arc<TxEntry>>
    where
        F: FnMut(&TxEntry) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .flatten()
            .find(|tx| pred(tx))
            .cloned()
    }

    /// Frees the slot of the CI with the given CTS and advances the head
    /// past freed slots. Returns `false` if no such CI is queued.
    pub fn remove(&self, cts: Ts) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|tx| tx.cts() == cts))
        else {
            return false;
        };
        inner.slots[pos] = None;
        inner.live -= 1;
        while matches!(inner.slots.front(), Some(None)) {
            inner.slots.pop_front();
        }
        true
    }

    /// CTS of the earliest live entry, if any.
    pub fn min_cts(&self) -> Option<Ts> {
        self.inner
            .lock()
            .slots
            .iter()
            .flatten()
            .next()
            .map(|tx| tx.cts())
    }

    /// Number of live (not yet concluded) entries.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
