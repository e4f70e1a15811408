use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::tx_entry::Ts;

/// Bits reserved at the bottom of every timestamp for the shard id.
pub const SHARD_BITS: u32 = 10;
/// Bits of the per-node logical counter, above the shard field.
pub const COUNTER_BITS: u32 = 10;
/// One logical tick: the smallest increment that keeps the shard field clear.
pub const TICK: u64 = 1 << SHARD_BITS;

const WALL_SHIFT: u32 = SHARD_BITS + COUNTER_BITS;

/// Monotone cluster clock.
///
/// A timestamp packs the local wall clock in microseconds into the high 44
/// bits, a logical counter into the next 10, and leaves the low 10 bits zero
/// for the sequencer's shard id. Monotonicity comes from a single atomic
/// `fetch_update` that takes the max of the wall-derived candidate and the
/// previous value advanced by one tick, so repeated calls are strictly
/// increasing on every thread and no serializing cycle-counter read is
/// needed.
pub struct ClusterTime {
    last: AtomicU64,
}

impl ClusterTime {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_candidate()),
        }
    }

    /// Returns a timestamp strictly greater than any previously returned on
    /// this node.
    pub fn now(&self) -> Ts {
        let candidate = wall_candidate();
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(prev.wrapping_add(TICK).max(candidate))
            })
            .expect("fetch_update closure never returns None")
            .wrapping_add(TICK)
            .max(candidate)
    }

    /// `now()` advanced by `delta` logical ticks. The sequencer uses the
    /// delta to leave room for clock skew and in-flight CIs.
    pub fn now_delta(&self, delta: u64) -> Ts {
        self.now() + delta * TICK
    }

    /// Recovers the local wall-clock equivalent of a cluster timestamp.
    /// Diagnostics only.
    pub fn cluster_to_local(ts: Ts) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(ts >> WALL_SHIFT)
    }
}

impl Default for ClusterTime {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_candidate() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    micros << WALL_SHIFT
}

/// Allocates commit timestamps.
///
/// A CTS is a cluster time advanced by the configured delta, with the shard
/// id embedded in the reserved low bits, making it unique across shards and
/// strictly increasing within one.
pub struct Sequencer {
    clock: Arc<ClusterTime>,
    shard_id: u64,
    delta: u64,
}

impl Sequencer {
    pub fn new(clock: Arc<ClusterTime>, shard_id: u64, delta: u64) -> Self {
        debug_assert!(shard_id < TICK);
        Self {
            clock,
            shard_id,
            delta,
        }
    }

    /// Returns the next commit timestamp.
    pub fn get_cts(&self) -> Ts {
        self.clock.now_delta(self.delta) | self.shard_id
    }
}
