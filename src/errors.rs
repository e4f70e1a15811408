use thiserror::Error;

/// Represents the possible errors that can occur within the serval validator.
///
/// Validation aborts are *not* errors: an aborted commit intent reports
/// `TxState::Abort` through its entry and flows to conclusion normally.
/// The variants here cover resource exhaustion, durability failures and
/// protocol breaches that the pipeline cannot absorb.
#[derive(Error, Debug)]
pub enum ServalError {
    /// The owning queue (local wait-list or distributed-tx set) rejected the
    /// commit intent because it is at capacity. Backpressure: the caller
    /// should retry later.
    #[error("commit-intent queue is full")]
    QueueFull,

    /// A counting Bloom filter refused an insert because a counter would
    /// overflow. The partial insert has been reverted.
    #[error("counting bloom filter counter overflow")]
    FilterOverflow,

    /// An I/O failure while appending to or reading the transaction log.
    /// Fatal for the partition: durability can no longer be guaranteed.
    #[error("tx log I/O error: {0}")]
    TxLogIo(#[from] std::io::Error),

    /// A transaction log record failed its head/tail signature check outside
    /// of the recoverable torn-tail position.
    #[error("tx log corruption at chunk {chunk} offset {offset}")]
    TxLogCorrupt { chunk: u64, offset: u64 },

    /// A wire message could not be decoded (short buffer or bad framing).
    #[error("wire decode error: {0}")]
    WireDecode(String),

    /// Record payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Peers returned contradictory final decisions for the same commit
    /// intent. Fatal consistency breach; requires operator intervention.
    #[error("peer decisions conflict for cts {0}")]
    PeerConflict(u64),

    /// The peer transport could not deliver a message.
    #[error("peer transport error: {0}")]
    PeerTransport(String),
}

/// A convenient type alias for the standard `Result` with `ServalError` as
/// the error type.
pub type Result<T> = std::result::Result<T, ServalError>;
