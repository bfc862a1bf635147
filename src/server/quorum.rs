//! Quorum response aggregation.
//!
//! Each peer call runs as its own task and funnels its result into a
//! `QuorumCollector` through a `Responder`. The collector decides exactly once
//! whether a quorum of successes has been reached or has become impossible,
//! and bounds the whole wait by a deadline. Results arriving after the
//! decision are ignored.

use std::fmt;

use crate::server::ReplicaId;
use crate::utils::{QuorumKvError, ReplicaMap};

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Majority quorum size of a cluster of `population` replicas.
#[inline]
pub fn majority(population: u8) -> u8 {
    population / 2 + 1
}

/// Final decision of a quorum wait.
#[derive(Debug)]
pub enum QuorumOutcome<T> {
    /// At least the required number of peers answered successfully.
    Reached { acks: Vec<(ReplicaId, T)> },

    /// Enough peers failed that the required successes are impossible.
    Unreachable {
        acks: Vec<(ReplicaId, T)>,
        failures: Vec<(ReplicaId, QuorumKvError)>,
    },

    /// The deadline passed before either of the above became certain.
    TimedOut {
        acks: Vec<(ReplicaId, T)>,
        failures: Vec<(ReplicaId, QuorumKvError)>,
    },
}

impl<T> QuorumOutcome<T> {
    /// Collapses the outcome into the caller's view: the successful answers,
    /// or a `QuorumNotReached` error whose cause names timeout vs failures.
    pub fn into_result(
        self,
        needed: u8,
    ) -> Result<Vec<(ReplicaId, T)>, QuorumKvError> {
        match self {
            Self::Reached { acks } => Ok(acks),
            Self::Unreachable { acks, failures } => {
                Err(QuorumKvError::QuorumNotReached {
                    needed,
                    acked: acks.len() as u8,
                    cause: format!("failures {}", FailureList(&failures)),
                })
            }
            Self::TimedOut { acks, failures } => {
                Err(QuorumKvError::QuorumNotReached {
                    needed,
                    acked: acks.len() as u8,
                    cause: format!("timed out, failures {}", FailureList(&failures)),
                })
            }
        }
    }
}

/// Display helper for per-replica failure lists in log lines.
struct FailureList<'a>(&'a [(ReplicaId, QuorumKvError)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, (peer, e)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", peer, e)?;
        }
        write!(f, "]")
    }
}

/// Which way a recorded response tipped the collector, if at all.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Decision {
    Reached,
    Unreachable,
}

/// Cloneable handle given to each peer-call task for reporting its result.
#[derive(Debug)]
pub struct Responder<T> {
    tx: mpsc::UnboundedSender<(ReplicaId, Result<T, QuorumKvError>)>,
}

impl<T> Clone for Responder<T> {
    fn clone(&self) -> Self {
        Responder {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Responder<T> {
    /// Reports the result of the call to `peer`. A no-op once the collector
    /// has been dropped after deciding.
    pub fn respond(&self, peer: ReplicaId, result: Result<T, QuorumKvError>) {
        let _ = self.tx.send((peer, result));
    }
}

/// Quorum response aggregator for one request fanned out to `targets`.
pub struct QuorumCollector<T> {
    /// Number of successful answers required.
    required: u8,

    /// Peers the request was sent to.
    targets: ReplicaMap,

    /// Peers whose answer has been counted already.
    answered: ReplicaMap,

    acks: Vec<(ReplicaId, T)>,
    failures: Vec<(ReplicaId, QuorumKvError)>,
    decided: Option<Decision>,

    tx: mpsc::UnboundedSender<(ReplicaId, Result<T, QuorumKvError>)>,
    rx: mpsc::UnboundedReceiver<(ReplicaId, Result<T, QuorumKvError>)>,
}

impl<T> QuorumCollector<T> {
    /// Creates a collector requiring `required` successes out of the peers
    /// set in `targets`.
    pub fn new(required: u8, targets: ReplicaMap) -> Result<Self, QuorumKvError> {
        if required == 0 || required > targets.count() {
            return Err(QuorumKvError::msg(format!(
                "invalid quorum size {} out of {} targets",
                required,
                targets.count()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let answered = ReplicaMap::new(targets.size(), false)?;
        Ok(QuorumCollector {
            required,
            targets,
            answered,
            acks: vec![],
            failures: vec![],
            decided: None,
            tx,
            rx,
        })
    }

    /// Returns a handle for peer-call tasks to report through.
    pub fn responder(&self) -> Responder<T> {
        Responder {
            tx: self.tx.clone(),
        }
    }

    /// Counts one answer. Answers from non-target peers, repeated answers
    /// from the same peer, and anything after the decision are ignored.
    /// Returns the decision if this answer produced it.
    pub fn record(
        &mut self,
        peer: ReplicaId,
        result: Result<T, QuorumKvError>,
    ) -> Option<Decision> {
        if self.decided.is_some()
            || !self.targets.get(peer).unwrap_or(false)
            || self.answered.get(peer).unwrap_or(true)
        {
            return None;
        }
        if self.answered.set(peer, true).is_err() {
            return None;
        }

        match result {
            Ok(ack) => {
                self.acks.push((peer, ack));
                if self.acks.len() >= self.required as usize {
                    self.decided = Some(Decision::Reached);
                }
            }
            Err(e) => {
                self.failures.push((peer, e));
                let tolerable = self.targets.count() - self.required;
                if self.failures.len() > tolerable as usize {
                    self.decided = Some(Decision::Unreachable);
                }
            }
        }
        self.decided
    }

    /// Waits until a decision is made or `deadline` passes, consuming the
    /// collector; outstanding peer calls may still finish but their results
    /// go nowhere.
    pub async fn wait(mut self, deadline: Duration) -> QuorumOutcome<T> {
        if deadline.is_zero() {
            // decide on whatever has been recorded so far
            return self.into_outcome();
        }
        let timeout = time::sleep(deadline);
        tokio::pin!(timeout);

        while self.decided.is_none() {
            tokio::select! {
                biased;

                answer = self.rx.recv() => {
                    // never `None` as I hold a sender myself
                    if let Some((peer, result)) = answer {
                        self.record(peer, result);
                    }
                },

                _ = &mut timeout => break,
            }
        }

        self.into_outcome()
    }

    fn into_outcome(self) -> QuorumOutcome<T> {
        match self.decided {
            Some(Decision::Reached) => QuorumOutcome::Reached { acks: self.acks },
            Some(Decision::Unreachable) => QuorumOutcome::Unreachable {
                acks: self.acks,
                failures: self.failures,
            },
            None => QuorumOutcome::TimedOut {
                acks: self.acks,
                failures: self.failures,
            },
        }
    }
}
