mod common;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{test_config, write_intent};
use crossbeam_channel::Receiver;
use serval::{
    ChannelTransport, CiState, PeerSsnInfo, SsnMeta, TupleRef, TxEntry, TxState, Validator,
    TS_MAX,
};

const SHARD_1: u64 = 1;
const SHARD_2: u64 = 2;

fn cross_shard_intent(key: &[u8], value: &[u8], cts: u64) -> TxEntry {
    let tx = TxEntry::new(
        Vec::new(),
        vec![TupleRef::write(key, value, SsnMeta::default())],
        vec![SHARD_1, SHARD_2],
        0,
    );
    tx.set_cts(cts);
    tx
}

struct Mailboxes {
    rx1: Receiver<PeerSsnInfo>,
    rx2: Receiver<PeerSsnInfo>,
}

impl Mailboxes {
    /// Delivers every queued notification to its destination shard.
    fn pump(&self, s1: &Validator, s2: &Validator) {
        for info in self.rx1.try_iter() {
            s1.handle_peer_info(&info).unwrap();
        }
        for info in self.rx2.try_iter() {
            s2.handle_peer_info(&info).unwrap();
        }
    }
}

/// Two validators over one in-process transport; the test pumps each
/// shard's inbound mailbox the way the node's listener thread would.
fn two_shards(dir1: &Path, dir2: &Path) -> (Validator, Validator, Mailboxes) {
    let transport = Arc::new(ChannelTransport::new());
    let rx1 = transport.register(SHARD_1);
    let rx2 = transport.register(SHARD_2);
    let s1 = Validator::new(test_config(SHARD_1, dir1), transport.clone()).unwrap();
    let s2 = Validator::new(test_config(SHARD_2, dir2), transport).unwrap();
    (s1, s2, Mailboxes { rx1, rx2 })
}

fn drive_until<F: Fn() -> bool>(s1: &Validator, s2: &Validator, mail: &Mailboxes, done: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "cross-shard pipeline stalled");
        s1.poll_once().unwrap();
        s2.poll_once().unwrap();
        mail.pump(s1, s2);
        thread::yield_now();
    }
}

#[test]
fn test_cross_shard_commit() {
    // Each shard holds half the write set of one CI; the merged partials
    // commit on both with the same CTS.
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (s1, s2, mail) = two_shards(dir1.path(), dir2.path());

    let cts = 1 << 40;
    let tx1 = s1.submit(cross_shard_intent(b"left", &[1], cts)).unwrap();
    let tx2 = s2.submit(cross_shard_intent(b"right", &[2], cts)).unwrap();

    drive_until(&s1, &s2, &mail, || {
        tx1.ci_state() == CiState::Concluded && tx2.ci_state() == CiState::Concluded
    });

    assert_eq!(tx1.tx_state(), TxState::Commit);
    assert_eq!(tx2.tx_state(), TxState::Commit);
    assert_eq!(s1.tuple_store().get_value(b"left").unwrap(), vec![1]);
    assert_eq!(s2.tuple_store().get_value(b"right").unwrap(), vec![2]);
    assert_eq!(s1.tx_log().get_tx_state(cts), Some(TxState::Commit));
    assert_eq!(s2.tx_log().get_tx_state(cts), Some(TxState::Commit));
}

#[test]
fn test_cross_shard_abort_propagates_via_stamps() {
    // Shard 2's half reads a stale snapshot; the merged stamps close the
    // exclusion window on both shards identically.
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (s1, s2, mail) = two_shards(dir1.path(), dir2.path());

    // Prime shard 2: commit "x" twice so an old snapshot is overwritten.
    s2.submit(write_intent(b"x", &[0])).unwrap();
    s2.serialize_until_idle().unwrap();
    let stale = s2.tuple_store().get_meta(b"x").unwrap();
    s2.submit(write_intent(b"x", &[1])).unwrap();
    s2.serialize_until_idle().unwrap();

    let cts = 1 << 41;
    let tx1 = s1.submit(cross_shard_intent(b"left", &[1], cts)).unwrap();
    let half2 = TxEntry::new(
        vec![TupleRef::read(b"x".as_slice(), stale)],
        vec![TupleRef::write(
            b"right".as_slice(),
            [2u8].as_slice(),
            SsnMeta::default(),
        )],
        vec![SHARD_1, SHARD_2],
        0,
    );
    half2.set_cts(cts);
    let tx2 = s2.submit(half2).unwrap();

    drive_until(&s1, &s2, &mail, || {
        tx1.ci_state() == CiState::Concluded && tx2.ci_state() == CiState::Concluded
    });

    assert_eq!(tx1.tx_state(), TxState::Abort);
    assert_eq!(tx2.tx_state(), TxState::Abort);
    assert!(s1.tuple_store().get_value(b"left").is_none());
    assert!(s2.tuple_store().get_value(b"right").is_none());
}

#[test]
fn test_cross_shard_conflict() {
    // Contradictory final decisions: shard 1 would commit but its peer
    // reports a final ABORT; shard 2 would abort but its peer reports a
    // final COMMIT. Both must conclude CONFLICT and touch no tuples.
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let (s1, s2, mail) = two_shards(dir1.path(), dir2.path());

    // Prime shard 2 so its local validation aborts.
    s2.submit(write_intent(b"x", &[0])).unwrap();
    s2.serialize_until_idle().unwrap();
    let stale = s2.tuple_store().get_meta(b"x").unwrap();
    s2.submit(write_intent(b"x", &[1])).unwrap();
    s2.serialize_until_idle().unwrap();

    let cts = 1 << 42;
    let tx1 = s1.submit(cross_shard_intent(b"left", &[1], cts)).unwrap();
    let half2 = TxEntry::new(
        vec![TupleRef::read(b"x".as_slice(), stale)],
        vec![TupleRef::write(
            b"right".as_slice(),
            [2u8].as_slice(),
            SsnMeta::default(),
        )],
        vec![SHARD_1, SHARD_2],
        0,
    );
    half2.set_cts(cts);
    let tx2 = s2.submit(half2).unwrap();

    // Dispatch both halves so each publishes its partial, then drop the
    // genuine partials instead of delivering them.
    s1.serialize_until_idle().unwrap();
    s2.serialize_until_idle().unwrap();
    for _ in mail.rx1.try_iter() {}
    for _ in mail.rx2.try_iter() {}

    // Forge the contradictory final decisions.
    s1.handle_peer_info(&PeerSsnInfo {
        cts,
        pstamp: 0,
        sstamp: TS_MAX,
        sender_peer_id: SHARD_2,
        tx_state: TxState::Abort,
    })
    .unwrap();
    s2.handle_peer_info(&PeerSsnInfo {
        cts,
        pstamp: 0,
        sstamp: TS_MAX,
        sender_peer_id: SHARD_1,
        tx_state: TxState::Commit,
    })
    .unwrap();
    s1.serialize_until_idle().unwrap();
    s2.serialize_until_idle().unwrap();

    assert_eq!(tx1.tx_state(), TxState::Conflict);
    assert_eq!(tx2.tx_state(), TxState::Conflict);
    assert!(s1.has_fatal_conflict());
    assert!(s2.has_fatal_conflict());
    assert_eq!(s1.tx_log().get_tx_state(cts), Some(TxState::Conflict));
    assert_eq!(s2.tx_log().get_tx_state(cts), Some(TxState::Conflict));
    assert!(s1.tuple_store().get_value(b"left").is_none());
    assert!(s2.tuple_store().get_value(b"right").is_none());
}

#[test]
fn test_peer_timeout_aborts_after_retry_budget() {
    // Shard 2 never answers; shard 1's CI goes PENDING -> ALERT -> ABORT
    // once the retry budget is spent.
    let dir1 = tempfile::tempdir().unwrap();
    let transport = Arc::new(ChannelTransport::new());
    let _rx1 = transport.register(SHARD_1);
    let _rx2 = transport.register(SHARD_2);
    let s1 = Validator::new(test_config(SHARD_1, dir1.path()), transport).unwrap();

    let cts = 1 << 43;
    let tx = s1.submit(cross_shard_intent(b"orphan", &[1], cts)).unwrap();
    s1.serialize_until_idle().unwrap();
    assert_eq!(tx.ci_state(), CiState::Waiting);

    let deadline = Instant::now() + Duration::from_secs(5);
    while tx.ci_state() != CiState::Concluded {
        assert!(Instant::now() < deadline, "timeout path never resolved");
        thread::sleep(Duration::from_millis(5));
        s1.poll_once().unwrap();
    }

    assert_eq!(tx.tx_state(), TxState::Abort);
    assert!(s1.tuple_store().get_value(b"orphan").is_none());
    assert_eq!(s1.tx_log().get_tx_state(cts), Some(TxState::Abort));
}

#[test]
fn test_info_request_answered_from_log() {
    // A peer asking about a concluded CTS gets the final decision back.
    let dir1 = tempfile::tempdir().unwrap();
    let transport = Arc::new(ChannelTransport::new());
    let _rx1 = transport.register(SHARD_1);
    let rx2 = transport.register(SHARD_2);
    let s1 = Validator::new(test_config(SHARD_1, dir1.path()), transport).unwrap();

    let tx = s1.submit(write_intent(b"done", &[9])).unwrap();
    s1.serialize_until_idle().unwrap();
    assert_eq!(tx.tx_state(), TxState::Commit);

    s1.handle_info_request(tx.cts(), SHARD_2).unwrap();
    let reply = rx2.try_recv().expect("reply expected");
    assert_eq!(reply.cts, tx.cts());
    assert_eq!(reply.tx_state, TxState::Commit);
    assert_eq!(reply.sender_peer_id, SHARD_1);
}

#[test]
fn test_distributed_tx_set_classification() {
    use serval::{ActiveTxSet, DistributedTxSet};

    // Same-key CIs: the first is independent, followers are dependent and
    // drain strictly in CTS order behind it.
    let set = DistributedTxSet::new(64, 1 << 10, 1 << 10, 1 << 8, 2);
    let active = ActiveTxSet::new();

    let mk = |cts: u64| {
        let tx = TxEntry::new(
            Vec::new(),
            vec![TupleRef::write(
                b"shared".as_slice(),
                [0u8].as_slice(),
                SsnMeta::default(),
            )],
            vec![SHARD_1, SHARD_2],
            0,
        );
        tx.set_cts(cts);
        Arc::new(tx)
    };

    for cts in 1..=4 {
        assert!(set.add(mk(cts)));
    }
    assert_eq!(set.count(), 4);

    // Dispatch order must follow CTS despite the three sub-queues.
    for expected in 1..=4 {
        let tx = set
            .find_ready_tx(&active)
            .unwrap_or_else(|| panic!("cts {expected} should be dispatchable"));
        assert_eq!(tx.cts(), expected);
    }
    assert!(set.find_ready_tx(&active).is_none());
    assert_eq!(set.count(), 0);
}
