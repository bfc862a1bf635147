//! QuorumKV's server functionality modules.

mod external;
mod generation;
mod messages;
mod quorum;
mod replica;
mod storage;
mod transport;
mod version;

#[cfg(any(test, feature = "fault-injection"))]
mod faults;

pub use messages::{
    ApiReply, ApiRequest, Command, CommandResult, PeerMsg, PeerReply,
    PeerReplyMsg, PeerRequest, RequestId, SetValueResult,
};
pub use quorum::{
    majority, Decision, QuorumCollector, QuorumOutcome, Responder,
};
pub use replica::{
    QuorumKvNode, QuorumKvReplica, ReadRepairMode, ReplicaConfigQuorumKv,
    ReplicaId,
};
pub use storage::DurableKvStore;
pub use transport::{PeerHandler, PeerTransport, TcpTransport};
pub use version::{Generation, MonotonicId, StoredValue, FIRST_GENERATION};

#[cfg(any(test, feature = "fault-injection"))]
pub use faults::{FaultControls, FaultyTransport};
