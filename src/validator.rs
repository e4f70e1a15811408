use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;
use log::{debug, error, warn};

use crate::clock::{ClusterTime, Sequencer};
use crate::config::ValidatorConfig;
use crate::data_store::mem_stream::{self, PeerSsnInfo};
use crate::data_store::tuple_store::TupleStore;
use crate::distributed::{PeerExchange, PeerTransport};
use crate::errors::{Result, ServalError};
use crate::schedule::active_tx_set::ActiveTxSet;
use crate::schedule::distributed_tx_set::DistributedTxSet;
use crate::schedule::wait_list::WaitList;
use crate::tx_entry::{CiState, Ts, TxEntry, TxState, TS_MAX};
use crate::tx_log::{TxLog, TxRecord};

/// One validator instance per storage node (per partition).
///
/// Owns the whole validation pipeline: intake assigns a CTS and logs the
/// pending CI, the serializer drains the local and distributed queues
/// through the active-tx set, runs the SSN exclusion checks, and concludes
/// each CI into the tuple store and the tx log. Cross-shard CIs
/// additionally pass through the peer exchange.
pub struct Validator {
    config: ValidatorConfig,
    clock: Arc<ClusterTime>,
    sequencer: Sequencer,
    tuple_store: Arc<TupleStore>,
    active_tx_set: ActiveTxSet,
    local_queue: WaitList,
    distributed_tx_set: DistributedTxSet,
    tx_log: Arc<TxLog>,
    exchange: PeerExchange,
    resolved_rx: channel::Receiver<Arc<TxEntry>>,
    committed: AtomicU64,
    aborted: AtomicU64,
    fatal_conflict: AtomicBool,
    shutdown: AtomicBool,
}

impl Validator {
    pub fn new(config: ValidatorConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let clock = Arc::new(ClusterTime::new());
        let sequencer = Sequencer::new(clock.clone(), config.shard_id, config.sequencer_delta);
        let tx_log = Arc::new(TxLog::with_chunk_size(
            &config.txlog_dir,
            config.txlog_chunk_size,
        )?);
        let (exchange, resolved_rx) = PeerExchange::new(
            config.shard_id,
            transport,
            config.peer_timeout,
            config.peer_retry_budget,
        );
        Ok(Self {
            sequencer,
            clock,
            tuple_store: Arc::new(TupleStore::new()),
            active_tx_set: ActiveTxSet::new(),
            local_queue: WaitList::new(config.queue_capacity),
            distributed_tx_set: DistributedTxSet::new(
                config.queue_capacity,
                config.cbf_independent_size,
                config.cbf_cold_size,
                config.cbf_hot_size,
                config.hot_threshold,
            ),
            tx_log,
            exchange,
            resolved_rx,
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            fatal_conflict: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    pub fn tuple_store(&self) -> &Arc<TupleStore> {
        &self.tuple_store
    }

    pub fn tx_log(&self) -> &Arc<TxLog> {
        &self.tx_log
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn aborted_count(&self) -> u64 {
        self.aborted.load(Ordering::Acquire)
    }

    /// True once peers have returned contradictory final decisions; the
    /// affected keys are unusable until an operator intervenes.
    pub fn has_fatal_conflict(&self) -> bool {
        self.fatal_conflict.load(Ordering::Acquire)
    }

    /// Accepts a commit intent. A CTS is assigned unless the coordinator
    /// already carries one (cross-shard CIs share the coordinator's CTS on
    /// every shard), the pending state is made durable, and the CI is
    /// routed to the local queue or, through the peer exchange, to the
    /// distributed-tx set. `QueueFull` propagates backpressure.
    pub fn submit(&self, tx: TxEntry) -> Result<Arc<TxEntry>> {
        if tx.cts() == 0 {
            tx.set_cts(self.sequencer.get_cts());
        }
        tx.set_ci_state(CiState::Queued);
        self.tx_log.append(&tx)?;
        let tx = Arc::new(tx);
        if let Err(e) = self.enqueue(tx.clone()) {
            // Supersede the pending record so a restart does not resurrect a
            // CI the caller was told to retry.
            tx.set_tx_state(TxState::Abort);
            self.tx_log.append(&tx)?;
            return Err(e);
        }
        Ok(tx)
    }

    /// Decodes and submits a wire-framed commit intent.
    pub fn submit_wire(&self, buf: &[u8]) -> Result<Arc<TxEntry>> {
        self.submit(mem_stream::decode_commit_intent(buf)?)
    }

    fn enqueue(&self, tx: Arc<TxEntry>) -> Result<()> {
        if tx.is_local() {
            if !self.local_queue.push(tx) {
                return Err(ServalError::QueueFull);
            }
        } else {
            self.exchange.begin(tx.clone());
            if !self.distributed_tx_set.add(tx.clone()) {
                self.exchange.cancel(tx.cts());
                return Err(ServalError::QueueFull);
            }
        }
        Ok(())
    }

    /// Merges an inbound peer SSN-info message. Infos for concluded CIs are
    /// answered against the tx log; a contradictory final decision there is
    /// the fatal cross-shard breach.
    pub fn handle_peer_info(&self, info: &PeerSsnInfo) -> Result<()> {
        if self.exchange.receive_info(info) {
            return Ok(());
        }
        let Some(final_state) = self.tx_log.get_tx_state(info.cts) else {
            debug!("peer info for unknown cts {}", info.cts);
            return Ok(());
        };
        let contradiction = matches!(
            (final_state, info.tx_state),
            (TxState::Commit, TxState::Abort) | (TxState::Abort, TxState::Commit)
        );
        if contradiction {
            error!(
                "peer {} reports {:?} for cts {} we concluded {:?}: consistency breach",
                info.sender_peer_id, info.tx_state, info.cts, final_state
            );
            self.fatal_conflict.store(true, Ordering::Release);
            self.tx_log.record_conflict(info.cts)?;
        }
        Ok(())
    }

    /// Answers a peer's request for the SSN info of `cts`: the open partial
    /// if the exchange still runs, else the concluded state from the log.
    pub fn handle_info_request(&self, cts: Ts, requester: u64) -> Result<()> {
        if self.exchange.answer_info_request(cts, requester)? {
            return Ok(());
        }
        if let Some(state) = self.tx_log.get_tx_state(cts) {
            let info = PeerSsnInfo {
                cts,
                pstamp: 0,
                sstamp: TS_MAX,
                sender_peer_id: self.config.shard_id,
                tx_state: state,
            };
            self.exchange_transport_notify(requester, &info)?;
        }
        Ok(())
    }

    fn exchange_transport_notify(&self, peer: u64, info: &PeerSsnInfo) -> Result<()> {
        // Routed through the exchange so the transport stays in one place.
        self.exchange.notify_raw(peer, info)
    }

    /// Re-enqueues the CIs whose last durable state is PENDING, oldest
    /// first. Called once after a restart, before serving traffic.
    pub fn resubmit_pending(&self) -> Result<usize> {
        let mut count = 0;
        let mut cursor = self.tx_log.first_pending();
        while let Some(record) = cursor {
            let next = self.tx_log.next_pending(record.cts);
            let tx = entry_from_record(&record);
            tx.set_ci_state(CiState::Queued);
            self.enqueue(Arc::new(tx))?;
            count += 1;
            cursor = next;
        }
        Ok(count)
    }

    /// One scheduling round: concluded exchanges first, then the local
    /// queue, then the distributed set. Returns whether any CI advanced.
    pub fn poll_once(&self) -> Result<bool> {
        self.exchange.check_deadlines();
        let resolved = self.process_resolved()?;
        let local = self.process_local()?;
        let dist = self.process_distributed()?;
        Ok(resolved || local || dist)
    }

    /// Drains the pipeline until no CI can advance. Cross-shard CIs whose
    /// peers have not reported yet stay parked.
    pub fn serialize_until_idle(&self) -> Result<()> {
        while self.poll_once()? {}
        Ok(())
    }

    /// Spawns the serializer and reaper threads. They run until
    /// `request_shutdown` and are joined by the returned handles.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let serializer = self.clone();
        handles.push(thread::spawn(move || {
            while !serializer.shutdown.load(Ordering::Acquire) {
                match serializer.poll_once() {
                    Ok(true) => {}
                    Ok(false) => thread::sleep(Duration::from_micros(100)),
                    Err(e) => {
                        error!("serializer halting: {e}");
                        break;
                    }
                }
            }
        }));

        let reaper = self.clone();
        handles.push(thread::spawn(move || {
            while !reaper.shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(10));
                if let Err(e) = reaper.reap_once() {
                    warn!("reaper pass failed: {e}");
                }
            }
        }));

        handles
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// One reaper pass: reclaim tombstones and sealed log chunks below the
    /// low-water CTS (nothing in flight or pending references them).
    pub fn reap_once(&self) -> Result<()> {
        let low_water = self.low_water_cts();
        self.tuple_store.sweep_tombstones(low_water);
        self.tx_log.trim_below_cts(low_water)?;
        Ok(())
    }

    fn low_water_cts(&self) -> Ts {
        [
            self.local_queue.min_cts(),
            self.distributed_tx_set.min_cts(),
            self.exchange.min_open_cts(),
            self.tx_log.first_pending().map(|r| r.cts),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| self.clock.now())
    }

    fn process_resolved(&self) -> Result<bool> {
        let Ok(tx) = self.resolved_rx.try_recv() else {
            return Ok(false);
        };
        self.conclude(&tx)?;
        self.active_tx_set.remove(&tx);
        Ok(true)
    }

    fn process_local(&self) -> Result<bool> {
        let Some(tx) = self.local_queue.find_ready(|t| {
            if self.active_tx_set.blocks(t) {
                t.set_ci_state(CiState::Waiting);
                false
            } else {
                true
            }
        }) else {
            return Ok(false);
        };
        if !self.active_tx_set.add(&tx) {
            tx.set_ci_state(CiState::Waiting);
            return Ok(false);
        }
        tx.set_ci_state(CiState::InProgress);
        self.validate(&tx);
        tx.set_tx_state(if tx.is_exclusion_violated() {
            TxState::Abort
        } else {
            TxState::Commit
        });
        self.conclude(&tx)?;
        self.active_tx_set.remove(&tx);
        self.local_queue.remove(tx.cts());
        Ok(true)
    }

    fn process_distributed(&self) -> Result<bool> {
        let Some(tx) = self.distributed_tx_set.find_ready_tx(&self.active_tx_set) else {
            return Ok(false);
        };
        if !self.active_tx_set.add(&tx) {
            // Filter saturation; put the CI back and let capacity free up.
            if !self.distributed_tx_set.add(tx.clone()) {
                warn!("cts {} dropped to abort: queues saturated", tx.cts());
                tx.set_tx_state(TxState::Abort);
                self.exchange.cancel(tx.cts());
                self.conclude(&tx)?;
            }
            return Ok(false);
        }
        tx.set_ci_state(CiState::Transient);
        self.validate(&tx);
        tx.set_ci_state(CiState::InProgress);
        // The local partial is published even when the exclusion already
        // failed here: peers reach the same verdict from the merged stamps.
        self.exchange.publish(&tx)?;
        Ok(true)
    }

    /// SSN exclusion: reads raise eta to the version's read stamp and close
    /// pi against overwrites of the snapshot; writes raise eta past every
    /// read of the version being replaced. Aborts early once `pi <= eta`.
    fn validate(&self, tx: &TxEntry) {
        for r in &tx.read_set {
            let meta = self.tuple_store.get_meta(&r.key).unwrap_or_default();
            tx.maximize_eta(meta.p_stamp);
            if meta.c_stamp != r.meta.c_stamp {
                // The snapshot's version has been overwritten; its successor
                // stamp is the current version's creation.
                tx.minimize_pi(meta.c_stamp);
            } else if meta.s_stamp != TS_MAX {
                tx.minimize_pi(meta.s_stamp);
            }
            if tx.is_exclusion_violated() {
                return;
            }
        }
        for w in &tx.write_set {
            if let Some(meta) = self.tuple_store.get_meta(&w.key) {
                tx.maximize_eta(meta.p_stamp);
            }
            if tx.is_exclusion_violated() {
                return;
            }
        }
    }

    /// Applies the final decision: commits install the write set and raise
    /// the read stamps, aborts touch nothing, conflicts are surfaced and
    /// poison the affected keys. The transition is made durable last.
    fn conclude(&self, tx: &TxEntry) -> Result<()> {
        match tx.tx_state() {
            TxState::Commit => {
                for w in &tx.write_set {
                    self.tuple_store.put(&w.key, tx.cts(), tx.pi(), &w.value);
                }
                for r in &tx.read_set {
                    self.tuple_store.maximize_eta(&r.key, tx.cts());
                }
                self.committed.fetch_add(1, Ordering::AcqRel);
            }
            TxState::Conflict => {
                error!(
                    "cts {} concluded CONFLICT: operator intervention required",
                    tx.cts()
                );
                self.fatal_conflict.store(true, Ordering::Release);
            }
            _ => {
                self.aborted.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.tx_log.append(tx)?;
        tx.set_ci_state(CiState::Concluded);
        Ok(())
    }
}

fn entry_from_record(record: &TxRecord) -> TxEntry {
    let tx = TxEntry::new(
        record.read_set.clone(),
        record.write_set.clone(),
        record.shard_set.clone(),
        record.sender_peer_id,
    );
    tx.set_cts(record.cts);
    tx
}
