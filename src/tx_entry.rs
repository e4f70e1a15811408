use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::data_store::tuple_store::SsnMeta;

/// 64-bit cluster timestamp.
pub type Ts = u64;

/// "Unknown" / "open" sentinel: a version not yet overwritten, a bound not
/// yet tightened.
pub const TS_MAX: Ts = u64::MAX;
/// "Never" sentinel.
pub const TS_NEVER: Ts = 0;

/// Final outcome of a transaction as seen by this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxState {
    /// Active and in an unstable state.
    Pending = 1,
    /// Aborted.
    Abort = 2,
    /// Validated and committed.
    Commit = 3,
    /// Deactivated after a peer timeout; awaiting retried SSN info.
    Alert = 4,
    /// Peers returned contradictory commit/abort decisions. Fatal; requires
    /// operator recovery because no new transaction touching its read or
    /// write sets can proceed.
    Conflict = 5,
}

impl TxState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Pending),
            2 => Some(Self::Abort),
            3 => Some(Self::Commit),
            4 => Some(Self::Alert),
            5 => Some(Self::Conflict),
            _ => None,
        }
    }

    /// The meet of two peers' decisions. Pending defers, Abort dominates,
    /// agreement commits, and a commit/abort split is a consistency breach.
    pub fn meet(self, other: TxState) -> TxState {
        use TxState::*;
        match (self, other) {
            (Conflict, _) | (_, Conflict) => Conflict,
            (Pending, x) | (x, Pending) => x,
            (Alert, x) | (x, Alert) => x,
            (Abort, Commit) | (Commit, Abort) => Conflict,
            (Abort, Abort) => Abort,
            (Commit, Commit) => Commit,
        }
    }
}

/// Scheduling state of a commit intent. Only ever advances; `Concluded` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum CiState {
    /// Not (or no longer) queued for scheduling.
    Unqueued = 1,
    /// Queued for scheduling.
    Queued = 2,
    /// Blocked from being scheduled by a dependency.
    Waiting = 3,
    /// Scheduled, but its local eta and pi may still be bogus.
    Transient = 4,
    /// Scheduled with usable local eta and pi.
    InProgress = 5,
    /// Local eta and pi are finalized.
    Concluded = 6,
}

/// One read- or write-set element: the key, the value carried for writes,
/// and the meta snapshot the coordinator observed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleRef {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: SsnMeta,
}

impl TupleRef {
    pub fn read(key: impl Into<Vec<u8>>, meta: SsnMeta) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            meta,
        }
    }

    pub fn write(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, meta: SsnMeta) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            meta,
        }
    }
}

/// One commit intent under validation.
///
/// The entry is shared between the queues, the serializer and the peer
/// exchange behind an `Arc`, so the fields that move during validation
/// (stamps and states) are atomics. The read/write/shard sets are fixed at
/// intake.
pub struct TxEntry {
    cts: AtomicU64,
    eta: AtomicU64,
    pi: AtomicU64,
    tx_state: AtomicU32,
    ci_state: AtomicU32,
    pub read_set: Vec<TupleRef>,
    pub write_set: Vec<TupleRef>,
    pub shard_set: Vec<u64>,
    pub sender_peer_id: u64,
}

impl TxEntry {
    pub fn new(
        read_set: Vec<TupleRef>,
        write_set: Vec<TupleRef>,
        shard_set: Vec<u64>,
        sender_peer_id: u64,
    ) -> Self {
        Self {
            cts: AtomicU64::new(0),
            eta: AtomicU64::new(0),
            pi: AtomicU64::new(TS_MAX),
            tx_state: AtomicU32::new(TxState::Pending as u32),
            ci_state: AtomicU32::new(CiState::Unqueued as u32),
            read_set,
            write_set,
            shard_set,
            sender_peer_id,
        }
    }

    pub fn cts(&self) -> Ts {
        self.cts.load(Ordering::Acquire)
    }

    pub fn set_cts(&self, cts: Ts) {
        self.cts.store(cts, Ordering::Release);
    }

    pub fn eta(&self) -> Ts {
        self.eta.load(Ordering::Acquire)
    }

    pub fn pi(&self) -> Ts {
        self.pi.load(Ordering::Acquire)
    }

    /// Raises eta to at least `ts`.
    pub fn maximize_eta(&self, ts: Ts) {
        self.eta.fetch_max(ts, Ordering::AcqRel);
    }

    /// Lowers pi to at most `ts`.
    pub fn minimize_pi(&self, ts: Ts) {
        self.pi.fetch_min(ts, Ordering::AcqRel);
    }

    pub fn tx_state(&self) -> TxState {
        TxState::from_u8(self.tx_state.load(Ordering::Acquire) as u8)
            .expect("tx_state holds a valid discriminant")
    }

    pub fn set_tx_state(&self, state: TxState) {
        self.tx_state.store(state as u32, Ordering::Release);
    }

    pub fn ci_state(&self) -> CiState {
        match self.ci_state.load(Ordering::Acquire) {
            1 => CiState::Unqueued,
            2 => CiState::Queued,
            3 => CiState::Waiting,
            4 => CiState::Transient,
            5 => CiState::InProgress,
            _ => CiState::Concluded,
        }
    }

    pub fn set_ci_state(&self, state: CiState) {
        self.ci_state.store(state as u32, Ordering::Release);
    }

    /// The SSN exclusion window has closed: no serial order can place this
    /// transaction.
    pub fn is_exclusion_violated(&self) -> bool {
        self.pi() <= self.eta()
    }

    /// Single-shard CIs skip the peer exchange entirely.
    pub fn is_local(&self) -> bool {
        self.shard_set.len() <= 1
    }

    /// All keys the CI touches, writes first.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.write_set
            .iter()
            .chain(self.read_set.iter())
            .map(|r| r.key.as_slice())
    }
}

impl std::fmt::Debug for TxEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxEntry")
            .field("cts", &self.cts())
            .field("eta", &self.eta())
            .field("pi", &self.pi())
            .field("tx_state", &self.tx_state())
            .field("ci_state", &self.ci_state())
            .field("reads", &self.read_set.len())
            .field("writes", &self.write_set.len())
            .field("shards", &self.shard_set)
            .finish()
    }
}
