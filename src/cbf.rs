use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use ahash::RandomState;
use rand::Rng;

/// A counter slot usable by the filter: a saturating atomic of some width.
pub trait Counter: Default {
    fn load(&self) -> u32;
    fn incr(&self);
    fn decr(&self);
}

impl Counter for AtomicU8 {
    fn load(&self) -> u32 {
        u32::from(AtomicU8::load(self, Ordering::Acquire))
    }
    fn incr(&self) {
        self.fetch_add(1, Ordering::AcqRel);
    }
    fn decr(&self) {
        self.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Counter for AtomicU32 {
    fn load(&self) -> u32 {
        AtomicU32::load(self, Ordering::Acquire)
    }
    fn incr(&self) {
        self.fetch_add(1, Ordering::AcqRel);
    }
    fn decr(&self) {
        self.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counting Bloom filter with two hash positions.
///
/// It protects itself from overflowing any counter: an `add` that would
/// saturate either position is reverted and refused. The concurrency
/// contract is one incrementer thread and one or more decrementer threads
/// (possibly the same thread); `contains` may race with them and callers
/// must tolerate false positives.
pub struct CountingBloomFilter<C: Counter = AtomicU8> {
    counters: Box<[C]>,
    limit: u32,
    hashers: [RandomState; 2],
}

impl<C: Counter> CountingBloomFilter<C> {
    /// `size` counter slots, each refusing to exceed `limit`.
    pub fn new(size: usize, limit: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut seeded = || {
            RandomState::with_seeds(rng.gen(), rng.gen(), rng.gen(), rng.gen())
        };
        Self {
            counters: (0..size).map(|_| C::default()).collect(),
            limit,
            hashers: [seeded(), seeded()],
        }
    }

    fn indexes(&self, key: &[u8]) -> (usize, usize) {
        let mut h1 = self.hashers[0].build_hasher();
        key.hash(&mut h1);
        let mut h2 = self.hashers[1].build_hasher();
        key.hash(&mut h2);
        let n = self.counters.len();
        (h1.finish() as usize % n, h2.finish() as usize % n)
    }

    /// Increments both positions for `key`. Returns `false` and reverts the
    /// partial increment if either counter is saturated.
    pub fn add(&self, key: &[u8]) -> bool {
        let (i1, i2) = self.indexes(key);
        if self.counters[i1].load() >= self.limit {
            return false;
        }
        self.counters[i1].incr();
        if i1 != i2 && self.counters[i2].load() >= self.limit {
            self.counters[i1].decr();
            return false;
        }
        if i1 != i2 {
            self.counters[i2].incr();
        }
        true
    }

    /// Decrements both positions. The caller asserts a prior matching `add`.
    pub fn remove(&self, key: &[u8]) {
        let (i1, i2) = self.indexes(key);
        self.counters[i1].decr();
        if i1 != i2 {
            self.counters[i2].decr();
        }
    }

    /// True iff both positions are non-zero.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (i1, i2) = self.indexes(key);
        self.counters[i1].load() > 0 && self.counters[i2].load() > 0
    }

    /// Dependency score for `key`: the lesser of the two position values.
    pub fn count(&self, key: &[u8]) -> u32 {
        let (i1, i2) = self.indexes(key);
        self.counters[i1].load().min(self.counters[i2].load())
    }

    /// Zeroes all counters.
    pub fn clear(&self) {
        for c in self.counters.iter() {
            while c.load() > 0 {
                c.decr();
            }
        }
    }
}
