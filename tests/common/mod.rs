// Shared helpers; not every test binary uses every one.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serval::{
    ChannelTransport, SsnMeta, TupleRef, TxEntry, Validator, ValidatorConfig,
};

/// Config sized for tests: small log chunks, tight peer deadlines.
pub fn test_config(shard_id: u64, txlog_dir: &Path) -> ValidatorConfig {
    ValidatorConfig {
        shard_id,
        txlog_dir: txlog_dir.to_path_buf(),
        txlog_chunk_size: 1024 * 1024,
        sequencer_delta: 1000,
        cbf_independent_size: 1 << 12,
        cbf_cold_size: 1 << 10,
        cbf_hot_size: 1 << 8,
        hot_threshold: 255,
        queue_capacity: 4096,
        peer_timeout: Duration::from_millis(20),
        peer_retry_budget: 2,
    }
}

/// A single-shard validator over an isolated transport.
pub fn local_validator(txlog_dir: &Path) -> Validator {
    let transport = Arc::new(ChannelTransport::new());
    Validator::new(test_config(0, txlog_dir), transport).expect("validator setup")
}

/// A local commit intent writing one key.
pub fn write_intent(key: &[u8], value: &[u8]) -> TxEntry {
    TxEntry::new(
        Vec::new(),
        vec![TupleRef::write(key, value, SsnMeta::default())],
        vec![0],
        0,
    )
}

/// A local commit intent with explicit read and write sets.
pub fn read_write_intent(reads: Vec<(&[u8], SsnMeta)>, writes: Vec<(&[u8], &[u8])>) -> TxEntry {
    TxEntry::new(
        reads
            .into_iter()
            .map(|(k, meta)| TupleRef::read(k, meta))
            .collect(),
        writes
            .into_iter()
            .map(|(k, v)| TupleRef::write(k, v, SsnMeta::default()))
            .collect(),
        vec![0],
        0,
    )
}
