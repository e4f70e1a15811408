//! serval: SSN commit-intent validator for a distributed storage node.
//!
//! A storage node hands already-executed transactions (commit intents, CIs)
//! to the validator together with their read and write sets and per-tuple
//! meta. The validator assigns each CI a commit timestamp, schedules it
//! through an approximate active-transaction set, runs the Serial Safety
//! Net exclusion checks, and concludes it as committed or aborted while the
//! decision is made durable in an append-only transaction log. Cross-shard
//! CIs exchange SSN partials with their peer shards before concluding.

pub mod cbf;
pub mod clock;
pub mod config;
pub mod data_store;
pub mod distributed;
pub mod errors;
pub mod schedule;
pub mod tx_entry;
pub mod tx_log;
pub mod validator;

// Re-export key types and structs for easier access
pub use cbf::CountingBloomFilter;
pub use clock::{ClusterTime, Sequencer};
pub use config::ValidatorConfig;
pub use data_store::mem_stream::PeerSsnInfo;
pub use data_store::tuple_store::{SsnMeta, Tuple, TupleStore};
pub use distributed::{ChannelTransport, PeerExchange, PeerTransport};
pub use errors::{Result, ServalError};
pub use schedule::active_tx_set::ActiveTxSet;
pub use schedule::distributed_tx_set::DistributedTxSet;
pub use schedule::wait_list::WaitList;
pub use tx_entry::{CiState, Ts, TupleRef, TxEntry, TxState, TS_MAX, TS_NEVER};
pub use tx_log::{TxLog, TxRecord};
pub use validator::Validator;

/// serval prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::data_store::mem_stream::*;
    pub use crate::data_store::tuple_store::*;
    pub use crate::errors::*;
    pub use crate::tx_entry::*;
    pub use crate::validator::*;
    pub use crate::*;
}
