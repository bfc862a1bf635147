//! QuorumKV: a quorum-replicated key-value store.
//!
//! Writes are versioned and acknowledged by a majority of replicas; reads
//! collect a majority, return the latest version seen, and repair stale
//! replicas. Restarted replicas run at a strictly greater generation and
//! requests from their superseded incarnations are fenced off.

#[macro_use]
mod utils;

mod client;
mod server;

// Helper utilities, functions, and macros
pub use crate::utils::{logger_init, QuorumKvError, ReplicaMap};

// Server side public interface
pub use crate::server::{
    majority, ApiReply, ApiRequest, Command, CommandResult, Decision,
    DurableKvStore,
    Generation, MonotonicId, PeerHandler, PeerMsg, PeerReply, PeerReplyMsg,
    PeerRequest, PeerTransport, QuorumCollector, QuorumKvNode,
    QuorumKvReplica, QuorumOutcome, ReadRepairMode, ReplicaConfigQuorumKv,
    ReplicaId, RequestId, Responder, SetValueResult, StoredValue,
    TcpTransport, FIRST_GENERATION,
};

#[cfg(any(test, feature = "fault-injection"))]
pub use crate::server::{FaultControls, FaultyTransport};

// Client side public interface
pub use crate::client::{
    ClientApiStub, ClientId, ClientRecvStub, ClientSendStub, KvClient,
};
