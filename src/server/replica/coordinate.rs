//! QuorumKV -- coordinator write, read, and read repair.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{QuorumKvNode, ReadRepairMode, ReplicaId};

use crate::server::quorum::{majority, QuorumCollector, QuorumOutcome};
use crate::server::{
    MonotonicId, PeerMsg, PeerReply, PeerRequest, StoredValue,
};
use crate::utils::{QuorumKvError, ReplicaMap};

use tokio::time;

/// Error carried by a negative reply.
fn failure_of(reply: PeerReply, expected: &str) -> QuorumKvError {
    match reply {
        PeerReply::FencingRejected { current_generation } => {
            QuorumKvError::FencingRejected { current_generation }
        }
        PeerReply::LocalFailure { reason } => {
            QuorumKvError::msg(format!("peer failed locally: {}", reason))
        }
        reply => QuorumKvError::msg(format!(
            "unexpected reply to {}: {:?}",
            expected, reply
        )),
    }
}

/// Interprets a reply to `ReplicateWrite`.
fn ack_of(reply: PeerReply) -> Result<(), QuorumKvError> {
    match reply {
        PeerReply::Ack => Ok(()),
        reply => Err(failure_of(reply, "write")),
    }
}

/// Interprets a reply to `ReadOne`.
fn value_of(reply: PeerReply) -> Result<StoredValue, QuorumKvError> {
    match reply {
        PeerReply::Value { stored_value } => Ok(stored_value),
        reply => Err(failure_of(reply, "read")),
    }
}

// QuorumKvNode coordinator logic
impl QuorumKvNode {
    /// Sends `req` to every replica in `targets` concurrently, each call
    /// bounded by the peer timeout, and waits for `required` successes.
    async fn fan_out<T>(
        &self,
        targets: ReplicaMap,
        required: u8,
        req: PeerRequest,
        interpret: fn(PeerReply) -> Result<T, QuorumKvError>,
    ) -> Result<QuorumOutcome<T>, QuorumKvError>
    where
        T: Send + 'static,
    {
        let collector = QuorumCollector::new(required, targets.clone())?;
        let peer_timeout = self.peer_timeout();

        for peer in targets.ones() {
            let msg = PeerMsg {
                id: self.next_msg_id.fetch_add(1, Ordering::Relaxed),
                from: self.id,
                generation: self.generation,
                req: req.clone(),
            };
            let transport = self.transport.clone();
            let responder = collector.responder();

            tokio::spawn(async move {
                let result =
                    match time::timeout(peer_timeout, transport.call(peer, msg))
                        .await
                    {
                        Ok(Ok(reply)) => interpret(reply.reply),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(QuorumKvError::Timeout {
                            waited_ms: peer_timeout.as_millis() as u64,
                        }),
                    };
                responder.respond(peer, result);
            });
        }

        Ok(collector.wait(self.quorum_timeout()).await)
    }

    /// Coordinates a quorum write of `value` under `key`. Returns the version
    /// assigned on success. On failure the value may still be durable on the
    /// replicas that did acknowledge.
    pub async fn write(
        &self,
        key: &str,
        value: String,
    ) -> Result<MonotonicId, QuorumKvError> {
        let version = self.clock.lock().await.tick();
        let stored_value = StoredValue::new(value, version);
        let needed = majority(self.population);

        let outcome = self
            .fan_out(
                ReplicaMap::new(self.population, true)?,
                needed,
                PeerRequest::ReplicateWrite {
                    key: key.into(),
                    stored_value,
                },
                ack_of,
            )
            .await?;

        match outcome.into_result(needed) {
            Ok(acks) => {
                pf_debug!(
                    self.id;
                    "write '{}' @ {} acked by {:?}",
                    key,
                    version,
                    acks.iter().map(|(p, _)| *p).collect::<Vec<_>>()
                );
                Ok(version)
            }
            Err(e) => {
                pf_warn!(self.id; "write '{}' @ {} failed: {}", key, version, e);
                Err(e)
            }
        }
    }

    /// Coordinates a quorum read of `key`, answering with the latest value in
    /// the collected quorum (`StoredValue::EMPTY` if none has it) and
    /// repairing stale members according to the configured mode.
    pub async fn read(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<StoredValue, QuorumKvError> {
        let needed = majority(self.population);
        let outcome = self
            .fan_out(
                ReplicaMap::new(self.population, true)?,
                needed,
                PeerRequest::ReadOne { key: key.into() },
                value_of,
            )
            .await?;

        let answers = match outcome.into_result(needed) {
            Ok(answers) => answers,
            Err(e) => {
                pf_warn!(self.id; "read '{}' failed: {}", key, e);
                return Err(e);
            }
        };

        let latest = StoredValue::latest(answers.iter().map(|(_, v)| v))
            .cloned()
            .unwrap_or_default();
        let stale: Vec<ReplicaId> = answers
            .iter()
            .filter(|(_, v)| v.version < latest.version)
            .map(|(p, _)| *p)
            .collect();
        pf_debug!(
            self.id;
            "read '{}' latest @ {}, stale {:?}",
            key,
            latest.version,
            stale
        );

        if !stale.is_empty() {
            match self.config.read_repair_mode {
                ReadRepairMode::Synchronous => {
                    self.repair(key, &latest, &stale).await?;
                }
                ReadRepairMode::Asynchronous => {
                    let node = self.clone();
                    let key = key.to_string();
                    let repaired = latest.clone();
                    tokio::spawn(async move {
                        // failure already logged; nobody waits on it
                        let _ = node.repair(&key, &repaired, &stale).await;
                    });
                }
            }
        }

        Ok(latest)
    }

    /// Overwrites `key` with `latest` on every replica in `stale`. Succeeds
    /// only if all of them acknowledge.
    async fn repair(
        &self,
        key: &str,
        latest: &StoredValue,
        stale: &[ReplicaId],
    ) -> Result<(), QuorumKvError> {
        let targets =
            ReplicaMap::from_ids(self.population, stale.iter().copied())?;
        let needed = targets.count();

        let outcome = self
            .fan_out(
                targets,
                needed,
                PeerRequest::ReplicateWrite {
                    key: key.into(),
                    stored_value: latest.clone(),
                },
                ack_of,
            )
            .await?;

        match outcome.into_result(needed) {
            Ok(_) => {
                pf_debug!(
                    self.id;
                    "repaired '{}' @ {} on {:?}",
                    key,
                    latest.version,
                    stale
                );
                Ok(())
            }
            Err(e) => {
                pf_warn!(
                    self.id;
                    "read repair of '{}' on {:?} failed: {}",
                    key,
                    stale,
                    e
                );
                Err(QuorumKvError::ReadRepairFailed { key: key.into() })
            }
        }
    }
}
