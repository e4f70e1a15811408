use ahash::AHashMap as HashMap;
use crossbeam_channel as channel;
use parking_lot::RwLock;

use crate::data_store::mem_stream::PeerSsnInfo;
use crate::errors::{Result, ServalError};

/// Delivery of SSN-info notifications to peer shards.
///
/// The surrounding node provides the real RPC transport; the validator only
/// needs fire-and-forget delivery keyed by peer id.
pub trait PeerTransport: Send + Sync {
    fn notify(&self, peer: u64, info: &PeerSsnInfo) -> Result<()>;
}

/// In-process transport over crossbeam channels, for tests and
/// single-process clusters. Each registered peer drains its own receiver
/// into its validator.
pub struct ChannelTransport {
    senders: RwLock<HashMap<u64, channel::Sender<PeerSsnInfo>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a peer and returns the receiving end of its mailbox.
    pub fn register(&self, peer: u64) -> channel::Receiver<PeerSsnInfo> {
        let (tx, rx) = channel::unbounded();
        self.senders.write().insert(peer, tx);
        rx
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for ChannelTransport {
    fn notify(&self, peer: u64, info: &PeerSsnInfo) -> Result<()> {
        let senders = self.senders.read();
        let sender = senders
            .get(&peer)
            .ok_or_else(|| ServalError::PeerTransport(format!("unknown peer {peer}")))?;
        sender
            .send(*info)
            .map_err(|e| ServalError::PeerTransport(e.to_string()))
    }
}
