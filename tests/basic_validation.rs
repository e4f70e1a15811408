mod common;

use common::{local_validator, read_write_intent, write_intent};
use serval::data_store::mem_stream::{decode_commit_intent, encode_commit_intent, PeerSsnInfo};
use serval::{ServalError, SsnMeta, TupleRef, TxEntry, TxState, TS_MAX};

#[test]
fn test_solo_commit() {
    // One shard, one CI writing "a" = 0x01.
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());

    let tx = validator.submit(write_intent(b"a", &[0x01])).unwrap();
    validator.serialize_until_idle().unwrap();

    assert_eq!(tx.tx_state(), TxState::Commit);
    assert_eq!(validator.tuple_store().get_value(b"a").unwrap(), vec![0x01]);
    let meta = validator.tuple_store().get_meta(b"a").unwrap();
    assert_eq!(meta.c_stamp, tx.cts());
    assert_eq!(validator.committed_count(), 1);
    assert_eq!(validator.tx_log().get_tx_state(tx.cts()), Some(TxState::Commit));
}

#[test]
fn test_read_after_write_serialization() {
    // Tx1 writes "k" = 1 and concludes; Tx2 reads "k" and writes "k" = 2.
    // Both must commit, Tx2 serialized after Tx1.
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());

    let tx1 = validator.submit(write_intent(b"k", &[0x01])).unwrap();
    validator.serialize_until_idle().unwrap();
    assert_eq!(tx1.tx_state(), TxState::Commit);

    let snapshot = validator.tuple_store().get_meta(b"k").unwrap();
    let tx2 = validator
        .submit(read_write_intent(
            vec![(b"k".as_slice(), snapshot)],
            vec![(b"k".as_slice(), [0x02].as_slice())],
        ))
        .unwrap();
    validator.serialize_until_idle().unwrap();

    assert_eq!(tx2.tx_state(), TxState::Commit);
    assert_eq!(validator.tuple_store().get_value(b"k").unwrap(), vec![0x02]);
    assert!(tx2.eta() >= tx1.cts(), "Tx2 must serialize after Tx1");
    assert_eq!(
        validator.tuple_store().get_meta(b"k").unwrap().c_stamp,
        tx2.cts()
    );
}

#[test]
fn test_ssn_exclusion_abort() {
    // Tx2 reads a version of "k" that Tx1 overwrites before Tx2 validates:
    // eta >= Tx1.cts and pi <= Tx1.cts close the exclusion window.
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());

    let tx0 = validator.submit(write_intent(b"k", &[0x00])).unwrap();
    validator.serialize_until_idle().unwrap();
    assert_eq!(tx0.tx_state(), TxState::Commit);

    // Coordinator snapshot of the still-live version.
    let stale = validator.tuple_store().get_meta(b"k").unwrap();
    assert_eq!(stale.s_stamp, TS_MAX);

    let tx1 = validator.submit(write_intent(b"k", &[0x01])).unwrap();
    validator.serialize_until_idle().unwrap();
    assert_eq!(tx1.tx_state(), TxState::Commit);

    let tx2 = validator
        .submit(read_write_intent(
            vec![(b"k".as_slice(), stale)],
            vec![(b"j".as_slice(), [0xff].as_slice())],
        ))
        .unwrap();
    validator.serialize_until_idle().unwrap();

    assert_eq!(tx2.tx_state(), TxState::Abort);
    assert!(tx2.eta() >= tx1.cts());
    assert!(tx2.pi() <= tx1.cts());
    assert!(validator.tuple_store().get_value(b"j").is_none());
    assert_eq!(validator.tx_log().get_tx_state(tx2.cts()), Some(TxState::Abort));
}

#[test]
fn test_committed_writers_form_total_cts_order() {
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());

    let mut last_cts = 0;
    for v in 0..8u8 {
        let tx = validator.submit(write_intent(b"seq", &[v])).unwrap();
        validator.serialize_until_idle().unwrap();
        assert_eq!(tx.tx_state(), TxState::Commit);
        assert!(tx.cts() > last_cts);
        last_cts = tx.cts();
        let meta = validator.tuple_store().get_meta(b"seq").unwrap();
        assert_eq!(meta.c_stamp, tx.cts());
        assert!(meta.c_stamp <= meta.p_stamp);
    }
    assert_eq!(validator.committed_count(), 8);
}

#[test]
fn test_tuple_store_meta_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());
    let store = validator.tuple_store();

    let tuple = store.preput(b"inv", &[1, 2, 3]);
    assert!(store.put_new(tuple, 100, TS_MAX));
    let meta = store.get_meta(b"inv").unwrap();
    assert_eq!(meta.c_stamp, 100);
    assert_eq!(meta.p_stamp, 100);
    assert_eq!(meta.s_stamp, TS_MAX);
    assert!(meta.p_stamp_prev <= meta.c_stamp);
    assert!(meta.s_stamp_prev <= meta.c_stamp);

    // Second install under the same key loses.
    let dup = store.preput(b"inv", &[9]);
    assert!(!store.put_new(dup, 200, TS_MAX));

    store.maximize_eta(b"inv", 150);
    assert_eq!(store.get_meta(b"inv").unwrap().p_stamp, 150);
    // maximize_eta never lowers the stamp.
    store.maximize_eta(b"inv", 120);
    assert_eq!(store.get_meta(b"inv").unwrap().p_stamp, 150);

    store.put(b"inv", 300, TS_MAX, &[4, 5]);
    let meta = store.get_meta(b"inv").unwrap();
    assert_eq!(meta.c_stamp, 300);
    assert_eq!(meta.p_stamp_prev, 150);
    assert!(meta.s_stamp_prev <= meta.c_stamp);
    assert_eq!(store.get_value(b"inv").unwrap(), vec![4, 5]);
}

#[test]
fn test_tuple_store_tombstone_retained_until_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());
    let store = validator.tuple_store();

    store.put(b"gone", 10, TS_MAX, &[1]);
    let mut aborting = store.get_meta(b"gone").unwrap();
    aborting.s_stamp = 11;
    assert!(store.remove(b"gone", aborting));

    // Value unreadable, meta still consulted.
    assert!(store.get_value(b"gone").is_none());
    assert_eq!(store.get_meta(b"gone").unwrap().s_stamp, 11);

    // Not freed while a CI with cts <= c_stamp could reference it.
    assert_eq!(store.sweep_tombstones(10), 0);
    assert_eq!(store.sweep_tombstones(11), 1);
    assert!(store.get_meta(b"gone").is_none());
}

#[test]
fn test_intake_backpressure_supersedes_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(0, dir.path());
    config.queue_capacity = 1;
    let transport = std::sync::Arc::new(serval::ChannelTransport::new());
    let validator = serval::Validator::new(config, transport).unwrap();

    validator.submit(write_intent(b"one", &[1])).unwrap();
    let err = validator.submit(write_intent(b"two", &[2])).unwrap_err();
    assert!(matches!(err, ServalError::QueueFull));

    // The refused CI's pending record is superseded so a restart cannot
    // resurrect it.
    let pending: Vec<u64> = std::iter::successors(
        validator.tx_log().first_pending(),
        |r| validator.tx_log().next_pending(r.cts),
    )
    .map(|r| r.cts)
    .collect();
    assert_eq!(pending.len(), 1);
}

#[test]
fn test_commit_intent_wire_round_trip() {
    let meta = SsnMeta {
        c_stamp: 7,
        p_stamp: 9,
        s_stamp: TS_MAX,
        p_stamp_prev: 3,
        s_stamp_prev: 5,
    };
    let tx = TxEntry::new(
        vec![TupleRef::read(b"read-key".as_slice(), meta)],
        vec![TupleRef::write(
            b"write-key".as_slice(),
            b"value".as_slice(),
            SsnMeta::default(),
        )],
        vec![1, 2, 3],
        42,
    );
    tx.set_cts(0xABCD);

    let bytes = encode_commit_intent(&tx);
    let decoded = decode_commit_intent(&bytes).unwrap();

    assert_eq!(decoded.cts(), 0xABCD);
    assert_eq!(decoded.sender_peer_id, 42);
    assert_eq!(decoded.read_set, tx.read_set);
    assert_eq!(decoded.write_set, tx.write_set);
    assert_eq!(decoded.shard_set, tx.shard_set);
}

#[test]
fn test_peer_info_wire_round_trip() {
    let info = PeerSsnInfo {
        cts: 99,
        pstamp: 10,
        sstamp: 20,
        sender_peer_id: 2,
        tx_state: TxState::Commit,
    };
    let decoded = PeerSsnInfo::decode(&info.encode()).unwrap();
    assert_eq!(decoded, info);
}

#[test]
fn test_wire_decode_rejects_short_buffer() {
    let err = decode_commit_intent(&[0u8; 7]).unwrap_err();
    assert!(matches!(err, ServalError::WireDecode(_)));
}

#[test]
fn test_submit_wire_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let validator = local_validator(dir.path());

    let intent = write_intent(b"wired", &[0x77]);
    let bytes = encode_commit_intent(&intent);
    let tx = validator.submit_wire(&bytes).unwrap();
    validator.serialize_until_idle().unwrap();

    assert_eq!(tx.tx_state(), TxState::Commit);
    assert_eq!(
        validator.tuple_store().get_value(b"wired").unwrap(),
        vec![0x77]
    );
}
