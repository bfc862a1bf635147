//! Client-facing and peer-facing message types.

use std::fmt;

use crate::server::{Generation, ReplicaId, StoredValue};

use serde::{Deserialize, Serialize};

/// Correlation ID type, for both client and peer requests.
pub type RequestId = u64;

/// Client command to be coordinated.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Quorum write of a value.
    SetValue {
        key: String,
        value: String,
        client_id: i64,
        request_number: i32,
        timestamp: i64,
    },

    /// Quorum read of the latest value.
    GetValue { key: String },
}

impl Command {
    /// Set command without client bookkeeping fields.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::SetValue {
            key: key.into(),
            value: value.into(),
            client_id: -1,
            request_number: -1,
            timestamp: -1,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Command::GetValue { key: key.into() }
    }
}

/// Outcome string of a client write.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum SetValueResult {
    Success,
    Error,
}

impl fmt::Display for SetValueResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Successful command result.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    SetValue { result: SetValueResult },
    GetValue { value: StoredValue },
}

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Regular request.
    Req {
        /// Client request ID.
        id: RequestId,

        /// Command to be coordinated.
        cmd: Command,
    },
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to regular request.
    Reply {
        /// ID of the corresponding client request.
        id: RequestId,

        /// Command result, or `None` if unsuccessful. Failures are kept
        /// opaque to clients.
        result: Option<CommandResult>,
    },
}

/// Peer request body.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Unconditionally overwrite the key with given value (writes and
    /// read repairs alike).
    ReplicateWrite {
        key: String,
        stored_value: StoredValue,
    },

    /// Return the local value of the key, possibly empty.
    ReadOne { key: String },
}

/// Peer request envelope.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PeerMsg {
    /// Correlation ID assigned by the coordinator.
    pub id: RequestId,

    /// Coordinator identity.
    pub from: ReplicaId,

    /// Coordinator's generation, checked by fencing.
    pub generation: Generation,

    pub req: PeerRequest,
}

/// Peer reply body.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    /// Write persisted.
    Ack,

    /// Local value returned for a read.
    Value { stored_value: StoredValue },

    /// Request refused because its generation is stale.
    FencingRejected { current_generation: Generation },

    /// Request accepted but could not be served locally, e.g. the write
    /// could not be made durable.
    LocalFailure { reason: String },
}

/// Peer reply envelope.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PeerReplyMsg {
    /// Correlation ID of the request being answered.
    pub id: RequestId,

    /// Responder identity.
    pub from: ReplicaId,

    pub reply: PeerReply,
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::server::MonotonicId;
    use crate::utils::QuorumKvError;

    use rmp_serde::decode::from_slice as decode_from_slice;
    use rmp_serde::encode::to_vec as encode_to_vec;

    #[test]
    fn set_defaults() {
        assert_eq!(
            Command::set("title", "Microservices"),
            Command::SetValue {
                key: "title".into(),
                value: "Microservices".into(),
                client_id: -1,
                request_number: -1,
                timestamp: -1,
            }
        );
        assert_eq!(format!("{}", SetValueResult::Success), "Success");
        assert_eq!(format!("{}", SetValueResult::Error), "Error");
    }

    #[test]
    fn peer_msg_wire_format() -> Result<(), QuorumKvError> {
        let msg = PeerMsg {
            id: 77,
            from: 2,
            generation: 3,
            req: PeerRequest::ReplicateWrite {
                key: "title".into(),
                stored_value: StoredValue::new(
                    "Microservices".into(),
                    MonotonicId::new(3, 1001),
                ),
            },
        };
        let decoded: PeerMsg = decode_from_slice(&encode_to_vec(&msg)?)?;
        assert_eq!(decoded, msg);

        let empty = PeerReplyMsg {
            id: 78,
            from: 0,
            reply: PeerReply::Value {
                stored_value: StoredValue::EMPTY,
            },
        };
        let decoded: PeerReplyMsg = decode_from_slice(&encode_to_vec(&empty)?)?;
        assert_eq!(decoded, empty);
        Ok(())
    }
}
