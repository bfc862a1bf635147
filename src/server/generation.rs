//! Per-process generation (epoch) bookkeeping and acceptance fencing.

use std::path::Path;

use crate::server::storage::DurableKvStore;
use crate::server::{Generation, ReplicaId, FIRST_GENERATION};
use crate::utils::QuorumKvError;

use tokio::sync::Mutex;

/// System store key holding this node's own generation.
const GENERATION_KEY: &str = "generation";

/// System store key holding the highest generation accepted from any
/// coordinator.
const ACCEPTED_KEY: &str = "accepted";

/// Side store for the node's generation counter and the node-wide fencing
/// threshold.
pub(crate) struct GenerationStore {
    me: ReplicaId,

    /// Durable backing map, separate from the data store.
    system: DurableKvStore<Generation>,

    /// Highest generation accepted so far, guarded for check-and-raise.
    accepted: Mutex<Generation>,
}

impl GenerationStore {
    /// Opens the system store at given path and loads the fencing threshold.
    pub(crate) async fn open(
        me: ReplicaId,
        path: &Path,
    ) -> Result<Self, QuorumKvError> {
        let system = DurableKvStore::open(me, path).await?;
        let accepted = system.get(ACCEPTED_KEY).await.unwrap_or(0);

        Ok(GenerationStore {
            me,
            system,
            accepted: Mutex::new(accepted),
        })
    }

    /// First phase of startup: computes the generation this process should
    /// run at, without persisting anything.
    pub(crate) async fn load_next(&self) -> Generation {
        match self.system.get(GENERATION_KEY).await {
            Some(generation) => generation + 1,
            None => FIRST_GENERATION,
        }
    }

    /// Second phase of startup: durably records the generation. The node must
    /// not serve requests unless this succeeded.
    pub(crate) async fn persist(
        &self,
        generation: Generation,
    ) -> Result<(), QuorumKvError> {
        self.system.put(GENERATION_KEY, generation).await?;
        pf_info!(self.me; "running at generation {}", generation);
        Ok(())
    }

    /// Lifts the in-memory threshold to the highest writer generation found
    /// among locally stored values. Those were accepted before, so nothing is
    /// persisted.
    pub(crate) async fn observe_stored(&self, known: Generation) {
        let mut accepted = self.accepted.lock().await;
        if known > *accepted {
            *accepted = known;
        }
    }

    /// Checks a request carrying `generation` against the node-wide
    /// threshold, raising the threshold if the request is newer. Returns
    /// `Err(FencingRejected)` if the request must be rejected.
    pub(crate) async fn check_and_raise(
        &self,
        generation: Generation,
    ) -> Result<(), QuorumKvError> {
        let mut accepted = self.accepted.lock().await;
        if generation < *accepted {
            return Err(QuorumKvError::FencingRejected {
                current_generation: *accepted,
            });
        }

        if generation > *accepted {
            // hold the lock across the persist so concurrent checks observe
            // the raised threshold only once it is durable
            self.system.put(ACCEPTED_KEY, generation).await?;
            *accepted = generation;
            pf_debug!(self.me; "fencing threshold raised to generation {}", generation);
        }
        Ok(())
    }

    /// Highest generation accepted so far; 0 if none.
    pub(crate) async fn accepted(&self) -> Generation {
        *self.accepted.lock().await
    }
}
