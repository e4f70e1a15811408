use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel as channel;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::data_store::mem_stream::PeerSsnInfo;
use crate::distributed::transport::PeerTransport;
use crate::errors::Result;
use crate::tx_entry::{CiState, Ts, TxEntry, TxState, TS_MAX};

struct ExchangeState {
    tx: Arc<TxEntry>,
    expected: HashSet<u64>,
    received: HashSet<u64>,
    /// Meet of the peer states received so far.
    merged: TxState,
    published: bool,
    deadline: Instant,
    retries_left: u32,
}

/// Tracks one exchange per in-flight cross-shard CTS and resolves each CI
/// once every peer reported, the retry budget ran out, or the decisions
/// contradicted.
///
/// Resolved entries are handed back to the serializer through a channel;
/// the exchange itself never touches the tuple store.
pub struct PeerExchange {
    local_shard_id: u64,
    transport: Arc<dyn PeerTransport>,
    states: Mutex<HashMap<Ts, ExchangeState>>,
    resolved_tx: channel::Sender<Arc<TxEntry>>,
    timeout: Duration,
    retry_budget: u32,
}

impl PeerExchange {
    pub fn new(
        local_shard_id: u64,
        transport: Arc<dyn PeerTransport>,
        timeout: Duration,
        retry_budget: u32,
    ) -> (Self, channel::Receiver<Arc<TxEntry>>) {
        let (resolved_tx, resolved_rx) = channel::unbounded();
        (
            Self {
                local_shard_id,
                transport,
                states: Mutex::new(HashMap::new()),
                resolved_tx,
                timeout,
                retry_budget,
            },
            resolved_rx,
        )
    }

    /// Registers a cross-shard CI at intake, before it enters the
    /// distributed-tx set. Peer infos may arrive any time after this.
    pub fn begin(&self, tx: Arc<TxEntry>) {
        let expected: HashSet<u64> = tx
            .shard_set
            .iter()
            .copied()
            .filter(|&s| s != self.local_shard_id)
            .collect();
        let mut states = self.states.lock();
        states.insert(
            tx.cts(),
            ExchangeState {
                tx,
                expected,
                received: HashSet::new(),
                merged: TxState::Pending,
                published: false,
                deadline: Instant::now() + self.timeout,
                retries_left: self.retry_budget,
            },
        );
    }

    /// Publishes the local partial after local validation. The CI parks
    /// WAITING; it resolves immediately if every peer already reported.
    pub fn publish(&self, tx: &Arc<TxEntry>) -> Result<()> {
        let info = PeerSsnInfo {
            cts: tx.cts(),
            pstamp: tx.eta(),
            sstamp: tx.pi(),
            sender_peer_id: self.local_shard_id,
            tx_state: TxState::Pending,
        };
        for &peer in tx.shard_set.iter().filter(|&&s| s != self.local_shard_id) {
            self.transport.notify(peer, &info)?;
        }
        tx.set_ci_state(CiState::Waiting);

        let mut states = self.states.lock();
        let complete = match states.get_mut(&tx.cts()) {
            Some(state) => {
                state.published = true;
                state.deadline = Instant::now() + self.timeout;
                state.received.is_superset(&state.expected)
            }
            None => false,
        };
        if complete {
            let state = states.remove(&tx.cts()).expect("entry just seen");
            drop(states);
            self.resolve(state);
        }
        Ok(())
    }

    /// Merges an arriving peer partial into the open exchange for its CTS.
    /// Returns `false` when no exchange is open (the CI already concluded
    /// or was never ours); the caller then consults the tx log.
    pub fn receive_info(&self, info: &PeerSsnInfo) -> bool {
        let mut states = self.states.lock();
        let complete = match states.get_mut(&info.cts) {
            Some(state) => {
                state.tx.maximize_eta(info.pstamp);
                if info.sstamp != TS_MAX {
                    state.tx.minimize_pi(info.sstamp);
                }
                state.merged = state.merged.meet(info.tx_state);
                state.received.insert(info.sender_peer_id);
                debug!(
                    "peer {} reported for cts {} ({:?})",
                    info.sender_peer_id, info.cts, info.tx_state
                );
                state.published && state.received.is_superset(&state.expected)
            }
            None => return false,
        };
        if complete {
            let state = states.remove(&info.cts).expect("entry just seen");
            drop(states);
            self.resolve(state);
        }
        true
    }

    /// Replies to a peer asking for the SSN info of `cts`: the in-flight
    /// partial if one exists, else nothing (the validator answers concluded
    /// CIs from the tx log).
    pub fn answer_info_request(&self, cts: Ts, requester: u64) -> Result<bool> {
        let states = self.states.lock();
        let Some(state) = states.get(&cts) else {
            return Ok(false);
        };
        let info = PeerSsnInfo {
            cts,
            pstamp: state.tx.eta(),
            sstamp: state.tx.pi(),
            sender_peer_id: self.local_shard_id,
            tx_state: TxState::Pending,
        };
        drop(states);
        self.transport.notify(requester, &info)?;
        Ok(true)
    }

    /// Walks the deadlines: an expired CI goes to ALERT and its partial is
    /// re-sent; once the retry budget is exhausted it resolves as ABORT.
    pub fn check_deadlines(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut states = self.states.lock();
            for (cts, state) in states.iter_mut() {
                if !state.published || now < state.deadline {
                    continue;
                }
                if state.retries_left > 0 {
                    state.retries_left -= 1;
                    state.deadline = now + self.timeout;
                    state.tx.set_tx_state(TxState::Alert);
                    let info = PeerSsnInfo {
                        cts: *cts,
                        pstamp: state.tx.eta(),
                        sstamp: state.tx.pi(),
                        sender_peer_id: self.local_shard_id,
                        tx_state: TxState::Pending,
                    };
                    for &peer in state
                        .tx
                        .shard_set
                        .iter()
                        .filter(|&&s| s != self.local_shard_id)
                    {
                        if state.received.contains(&peer) {
                            continue;
                        }
                        if let Err(e) = self.transport.notify(peer, &info) {
                            warn!("retry notify to peer {peer} failed: {e}");
                        }
                    }
                } else {
                    expired.push(*cts);
                }
            }
            for cts in &expired {
                if let Some(state) = states.remove(cts) {
                    warn!(
                        "cts {} aborted: peers {:?} silent past retry budget",
                        cts,
                        state
                            .expected
                            .difference(&state.received)
                            .collect::<Vec<_>>()
                    );
                    state.tx.set_tx_state(TxState::Abort);
                    let _ = self.resolved_tx.send(state.tx);
                }
            }
        }
    }

    /// Sends an arbitrary info through the underlying transport; used by the
    /// validator to answer info requests for concluded CIs.
    pub fn notify_raw(&self, peer: u64, info: &PeerSsnInfo) -> Result<()> {
        self.transport.notify(peer, info)
    }

    /// Drops the exchange for `cts` (the CI never entered the pipeline).
    pub fn cancel(&self, cts: Ts) {
        self.states.lock().remove(&cts);
    }

    /// Number of exchanges still open.
    pub fn open_count(&self) -> usize {
        self.states.lock().len()
    }

    /// Smallest CTS with an open exchange, for the low-water computation.
    pub fn min_open_cts(&self) -> Option<Ts> {
        self.states.lock().keys().min().copied()
    }

    fn resolve(&self, state: ExchangeState) {
        let local_decision = if state.tx.is_exclusion_violated() {
            TxState::Abort
        } else {
            TxState::Commit
        };
        // Partials carry PENDING; an explicit COMMIT or ABORT from a peer is
        // a final decision, so the meet either agrees with ours or exposes a
        // breach.
        let fin = state.merged.meet(local_decision);
        state.tx.set_tx_state(fin);
        let _ = self.resolved_tx.send(state.tx);
    }
}
