use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::tx_entry::{Ts, TS_MAX, TS_NEVER};

const BUCKET_COUNT: usize = 256;

/// Per-version SSN bookkeeping.
///
/// `c_stamp` is the creator's CTS, `p_stamp` the highest read-access
/// timestamp, `s_stamp` the successor (overwrite) timestamp or `TS_MAX`
/// while the version is live. The `*_prev` fields carry the predecessor
/// version's meta forward at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsnMeta {
    pub c_stamp: Ts,
    pub p_stamp: Ts,
    pub s_stamp: Ts,
    pub p_stamp_prev: Ts,
    pub s_stamp_prev: Ts,
}

impl Default for SsnMeta {
    fn default() -> Self {
        Self {
            c_stamp: TS_NEVER,
            p_stamp: TS_NEVER,
            s_stamp: TS_MAX,
            p_stamp_prev: TS_NEVER,
            s_stamp_prev: TS_NEVER,
        }
    }
}

/// One keyed version held by the store.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: SsnMeta,
    pub tombstone: bool,
}

impl Tuple {
    fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            meta: SsnMeta::default(),
            tombstone: false,
        }
    }
}

/// Keyed mapping of each key to its current tuple version.
///
/// The map is partitioned into buckets, each behind its own `RwLock`.
/// Writers on the same key serialize through the validator (the active-tx
/// set admits one committer per key at a time), so the bucket lock is only
/// held for the individual update.
pub struct TupleStore {
    buckets: Box<[RwLock<HashMap<Vec<u8>, Tuple>>]>,
}

impl TupleStore {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn bucket(&self, key: &[u8]) -> &RwLock<HashMap<Vec<u8>, Tuple>> {
        let h = ahash::RandomState::with_seeds(11, 22, 33, 44).hash_one(key);
        &self.buckets[h as usize % BUCKET_COUNT]
    }

    /// Builds a tuple handle from caller-owned bytes; nothing is installed
    /// until `put_new` or `put`.
    pub fn preput(&self, key: &[u8], value: &[u8]) -> Tuple {
        Tuple::new(key.to_vec(), value.to_vec())
    }

    /// Installs `tuple` if the key does not exist yet. The version is born
    /// live: `c_stamp = p_stamp = cts`, `s_stamp` open. Returns `false` if a
    /// concurrent writer won the slot.
    pub fn put_new(&self, mut tuple: Tuple, cts: Ts, s_stamp_prev: Ts) -> bool {
        tuple.meta = SsnMeta {
            c_stamp: cts,
            p_stamp: cts,
            s_stamp: TS_MAX,
            p_stamp_prev: TS_NEVER,
            s_stamp_prev: s_stamp_prev.min(cts),
        };
        let mut bucket = self.bucket(&tuple.key).write();
        if bucket.contains_key(&tuple.key) {
            return false;
        }
        bucket.insert(tuple.key.clone(), tuple);
        true
    }

    /// Overwrites the current version under `key` in place, carrying the
    /// replaced version's meta into the `*_prev` fields. Installs fresh if
    /// the key is absent.
    pub fn put(&self, key: &[u8], cts: Ts, pi: Ts, value: &[u8]) {
        let mut bucket = self.bucket(key).write();
        match bucket.get_mut(key) {
            Some(t) => {
                let prev = t.meta;
                t.meta = SsnMeta {
                    c_stamp: cts,
                    p_stamp: cts,
                    s_stamp: TS_MAX,
                    p_stamp_prev: prev.p_stamp,
                    s_stamp_prev: pi.min(cts),
                };
                t.value = value.to_vec();
                t.tombstone = false;
            }
            None => {
                let mut t = Tuple::new(key.to_vec(), value.to_vec());
                t.meta = SsnMeta {
                    c_stamp: cts,
                    p_stamp: cts,
                    s_stamp: TS_MAX,
                    p_stamp_prev: TS_NEVER,
                    s_stamp_prev: pi.min(cts),
                };
                bucket.insert(key.to_vec(), t);
            }
        }
    }

    /// Current tuple under `key`, if any.
    pub fn fetch(&self, key: &[u8]) -> Option<Tuple> {
        self.bucket(key).read().get(key).cloned()
    }

    /// Value bytes under `key`; `None` for missing or tombstoned keys.
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.bucket(key)
            .read()
            .get(key)
            .filter(|t| !t.tombstone)
            .map(|t| t.value.clone())
    }

    /// Snapshot of the current SSN meta under `key`.
    pub fn get_meta(&self, key: &[u8]) -> Option<SsnMeta> {
        self.bucket(key).read().get(key).map(|t| t.meta)
    }

    /// Raises the version's read stamp to at least `ts`.
    pub fn maximize_eta(&self, key: &[u8], ts: Ts) -> bool {
        match self.bucket(key).write().get_mut(key) {
            Some(t) => {
                t.meta.p_stamp = t.meta.p_stamp.max(ts);
                true
            }
            None => false,
        }
    }

    /// Marks the tuple logically deleted, retaining `meta` for later
    /// exclusion checks. The slot is reclaimed by the reaper, not here.
    pub fn remove(&self, key: &[u8], meta: SsnMeta) -> bool {
        match self.bucket(key).write().get_mut(key) {
            Some(t) => {
                t.tombstone = true;
                t.meta = meta;
                t.value.clear();
                true
            }
            None => false,
        }
    }

    /// Frees tombstoned tuples no in-flight CI can still reference: those
    /// whose `c_stamp` is below the low-water CTS. Returns how many were
    /// reclaimed.
    pub fn sweep_tombstones(&self, low_water_cts: Ts) -> usize {
        let mut freed = 0;
        for bucket in self.buckets.iter() {
            let mut map = bucket.write();
            let before = map.len();
            map.retain(|_, t| !(t.tombstone && t.meta.c_stamp < low_water_cts));
            freed += before - map.len();
        }
        freed
    }
}

impl Default for TupleStore {
    fn default() -> Self {
        Self::new()
    }
}
