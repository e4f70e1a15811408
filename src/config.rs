use std::path::PathBuf;

/// Default directory for transaction log chunks.
pub const DEFAULT_TXLOG_DIR: &str = "/dev/shm/txlog";
/// Default sequencer head-room, in logical clock ticks.
pub const DEFAULT_SEQUENCER_DELTA: u64 = 1000;
/// Default counter counts for the independent / cold / hot CBFs.
pub const DEFAULT_CBF_INDEPENDENT_SIZE: usize = 1 << 18;
pub const DEFAULT_CBF_COLD_SIZE: usize = 1 << 15;
pub const DEFAULT_CBF_HOT_SIZE: usize = 1 << 10;
/// Default cold-CBF count above which a dependent CI is classified hot.
pub const DEFAULT_HOT_THRESHOLD: u32 = 255;

/// Runtime configuration for one validator instance.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// This shard's id, embedded in the low bits of every CTS.
    pub shard_id: u64,
    /// Directory holding the transaction log chunks.
    pub txlog_dir: PathBuf,
    /// Size of each transaction log chunk file.
    pub txlog_chunk_size: u64,
    /// Head-room added to every CTS so it exceeds anything an in-flight CI
    /// could already have observed.
    pub sequencer_delta: u64,
    /// Counter counts of the three distributed-tx-set CBFs.
    pub cbf_independent_size: usize,
    pub cbf_cold_size: usize,
    pub cbf_hot_size: usize,
    /// Cold dependency score at or above which a CI goes to the hot queue.
    pub hot_threshold: u32,
    /// Capacity of the local reorder queue and of each distributed sub-queue.
    pub queue_capacity: usize,
    /// Peer-exchange deadline per attempt, and the retry budget.
    pub peer_timeout: std::time::Duration,
    pub peer_retry_budget: u32,
}

impl ValidatorConfig {
    /// Builds a config for `shard_id` from the environment, falling back to
    /// the documented defaults: `TXLOG_DIR`, `SEQUENCER_DELTA`,
    /// `CBF_INDEPENDENT_SIZE`, `CBF_COLD_SIZE`, `CBF_HOT_SIZE`,
    /// `HOT_THRESHOLD`.
    pub fn from_env(shard_id: u64) -> Self {
        Self {
            shard_id,
            txlog_dir: std::env::var("TXLOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_TXLOG_DIR)),
            txlog_chunk_size: env_parse("TXLOG_CHUNK_SIZE", 1024 * 1024 * 1024),
            sequencer_delta: env_parse("SEQUENCER_DELTA", DEFAULT_SEQUENCER_DELTA),
            cbf_independent_size: env_parse(
                "CBF_INDEPENDENT_SIZE",
                DEFAULT_CBF_INDEPENDENT_SIZE,
            ),
            cbf_cold_size: env_parse("CBF_COLD_SIZE", DEFAULT_CBF_COLD_SIZE),
            cbf_hot_size: env_parse("CBF_HOT_SIZE", DEFAULT_CBF_HOT_SIZE),
            hot_threshold: env_parse("HOT_THRESHOLD", DEFAULT_HOT_THRESHOLD),
            queue_capacity: 65536,
            peer_timeout: std::time::Duration::from_millis(200),
            peer_retry_budget: 3,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self::from_env(0)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
