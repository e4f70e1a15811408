//! Cross-shard SSN-info exchange.
//!
//! Each participating shard of a cross-shard commit intent validates
//! locally and notifies its peers of the partial `(eta, pi, state)`. The
//! exchange merges arriving partials and resolves the CI once every peer
//! has reported, timed out, or contradicted the others.

pub mod peer_exchange;
pub mod transport;

pub use peer_exchange::PeerExchange;
pub use transport::{ChannelTransport, PeerTransport};
