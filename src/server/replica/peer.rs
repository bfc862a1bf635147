//! QuorumKV -- serving peer requests.

use super::{QuorumKvNode, ReplicaId};

use crate::server::transport::PeerHandler;
use crate::server::{PeerMsg, PeerReply, PeerReplyMsg, PeerRequest};
use crate::utils::QuorumKvError;

use async_trait::async_trait;

#[async_trait]
impl PeerHandler for QuorumKvNode {
    async fn handle_peer_msg(&self, msg: PeerMsg) -> Option<PeerReplyMsg> {
        if msg.from >= self.population {
            pf_warn!(self.id; "request {} from unknown replica {}", msg.id, msg.from);
            return None;
        }

        // fencing applies to reads and writes alike
        let reply = match self.gens.check_and_raise(msg.generation).await {
            Ok(()) => self.serve_peer_req(msg.from, msg.req).await,

            Err(QuorumKvError::FencingRejected { current_generation }) => {
                pf_warn!(
                    self.id;
                    "fenced request {} from {} @ generation {} (accepted {})",
                    msg.id,
                    msg.from,
                    msg.generation,
                    current_generation
                );
                PeerReply::FencingRejected { current_generation }
            }

            Err(e) => {
                pf_error!(self.id; "error raising fencing threshold: {}", e);
                PeerReply::LocalFailure {
                    reason: e.to_string(),
                }
            }
        };

        Some(PeerReplyMsg {
            id: msg.id,
            from: self.id,
            reply,
        })
    }
}

impl QuorumKvNode {
    /// Applies an accepted peer request to the local store.
    async fn serve_peer_req(
        &self,
        from: ReplicaId,
        req: PeerRequest,
    ) -> PeerReply {
        match req {
            PeerRequest::ReplicateWrite { key, stored_value } => {
                let version = stored_value.version;
                // overwrite unconditionally; conflicts are resolved on read
                match self.store.put(&key, stored_value).await {
                    Ok(()) => {
                        pf_trace!(self.id; "stored '{}' @ {} from {}", key, version, from);
                        PeerReply::Ack
                    }
                    Err(e) => {
                        pf_error!(self.id; "error persisting '{}': {}", key, e);
                        PeerReply::LocalFailure {
                            reason: e.to_string(),
                        }
                    }
                }
            }

            PeerRequest::ReadOne { key } => PeerReply::Value {
                stored_value: self.store.get(&key).await.unwrap_or_default(),
            },
        }
    }
}
