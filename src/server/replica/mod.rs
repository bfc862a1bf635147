//! Quorum-replicated KV replica.
//!
//! Every replica is both a storage node and a coordinator. A client write is
//! stamped with a fresh version and replicated to all replicas (including
//! myself), succeeding once a majority has durably acknowledged it. A client
//! read collects a majority of local values, answers with the latest one, and
//! repairs the stale members of that majority, either before answering
//! (synchronous mode) or in the background (asynchronous mode).
//!
//! Every peer request carries the coordinator's generation, a number assigned
//! once per process start. Each replica remembers the highest generation it
//! has accepted from anyone and rejects anything older.

mod coordinate;
mod peer;
mod request;

#[cfg(test)]
mod cluster_tests;

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::server::external::ExternalApi;
use crate::server::generation::GenerationStore;
use crate::server::storage::DurableKvStore;
use crate::server::transport::{PeerTransport, TcpTransport};
use crate::server::version::VersionClock;
use crate::server::{Generation, MonotonicId, StoredValue};
use crate::utils::QuorumKvError;

use serde::Deserialize;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Server replica ID type.
pub type ReplicaId = u8;

/// When read repair happens relative to answering the read.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadRepairMode {
    /// Answer only after every stale quorum member acknowledged the repair.
    Synchronous,

    /// Answer immediately; repair in the background.
    Asynchronous,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigQuorumKv {
    /// Directory of the durable data store. The generation store lives in a
    /// sibling directory with a `_system` suffix.
    pub wal_dir: String,

    /// Read repair mode.
    pub read_repair_mode: ReadRepairMode,

    /// Deadline of each single peer call in millisecs.
    pub peer_timeout_ms: u64,

    /// Deadline of each quorum wait in millisecs.
    pub quorum_timeout_ms: u64,

    /// Capacity of the client req channel.
    pub api_chan_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigQuorumKv {
    fn default() -> Self {
        ReplicaConfigQuorumKv {
            wal_dir: "/tmp/quorumkv".into(),
            read_repair_mode: ReadRepairMode::Asynchronous,
            peer_timeout_ms: 1000,
            quorum_timeout_ms: 2000,
            api_chan_cap: 10000,
        }
    }
}

impl ReplicaConfigQuorumKv {
    /// Path of the data store file.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.wal_dir).join("data.wal")
    }

    /// Path of the generation store file.
    pub fn system_path(&self) -> PathBuf {
        let mut dir = OsString::from(self.wal_dir.trim_end_matches('/'));
        dir.push("_system");
        PathBuf::from(dir).join("system.wal")
    }
}

/// Shared replica state: the local store, the generation bookkeeping, and
/// the coordinator logic. Handed to the peer server as the request handler
/// and to every client request task.
pub struct QuorumKvNode {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Cluster size (number of replicas).
    population: u8,

    /// Configuration parameters struct.
    config: ReplicaConfigQuorumKv,

    /// My generation, fixed for the lifetime of this process.
    generation: Generation,

    /// Version stamp source for writes coordinated by me.
    clock: Mutex<VersionClock>,

    /// Next peer request ID.
    next_msg_id: AtomicU64,

    /// Durable local key -> value store.
    store: DurableKvStore<StoredValue>,

    /// Generation counter and fencing threshold.
    gens: GenerationStore,

    /// Peer transport, possibly decorated.
    transport: Arc<dyn PeerTransport>,
}

impl QuorumKvNode {
    /// Opens durable state under the configured directories and runs the
    /// two-phase generation init: the next generation is computed first and
    /// must be persisted before the node exists.
    async fn open(
        id: ReplicaId,
        population: u8,
        config: ReplicaConfigQuorumKv,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, QuorumKvError> {
        let gens = GenerationStore::open(id, &config.system_path()).await?;
        let generation = gens.load_next().await;
        gens.persist(generation).await?;

        let store: DurableKvStore<StoredValue> =
            DurableKvStore::open(id, &config.data_path()).await?;
        if let Some(known) = Self::max_generation_in(&store).await {
            gens.observe_stored(known).await;
        }

        Ok(QuorumKvNode {
            id,
            population,
            config,
            generation,
            clock: Mutex::new(VersionClock::new(generation)),
            next_msg_id: AtomicU64::new(0),
            store,
            gens,
            transport,
        })
    }

    /// My generation.
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Local value of a key, bypassing quorum logic.
    pub async fn local_get(&self, key: &str) -> Option<StoredValue> {
        self.store.get(key).await
    }

    /// Local version of a key; empty if absent.
    pub async fn version_of(&self, key: &str) -> MonotonicId {
        self.store
            .get(key)
            .await
            .map_or(MonotonicId::empty(), |v| v.version)
    }

    /// Highest writer generation among locally stored values, if any.
    pub async fn max_known_generation(&self) -> Option<Generation> {
        Self::max_generation_in(&self.store).await
    }

    /// Fencing threshold: the highest generation accepted so far, counting
    /// both requests served and values stored; 0 if none.
    pub async fn accepted_generation(&self) -> Generation {
        self.gens.accepted().await
    }

    async fn max_generation_in(
        store: &DurableKvStore<StoredValue>,
    ) -> Option<Generation> {
        store
            .all_entries()
            .await
            .into_iter()
            .map(|(_, v)| v.generation)
            .max()
    }

    #[inline]
    fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.config.peer_timeout_ms)
    }

    #[inline]
    fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.config.quorum_timeout_ms)
    }
}

/// QuorumKV server replica module.
pub struct QuorumKvReplica {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Shared node state.
    node: Arc<QuorumKvNode>,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// Join handle of the peer acceptor thread.
    peer_server_handle: JoinHandle<()>,
}

impl QuorumKvReplica {
    /// Creates a replica talking to peers over TCP. `replicas` lists the
    /// peer-facing addresses of all replicas, indexed by replica ID.
    pub async fn new_and_setup(
        id: ReplicaId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        replicas: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, QuorumKvError> {
        let transport = TcpTransport::new(id, replicas)?;
        let population = transport.population();
        Self::new_and_setup_with_transport(
            id, api_addr, p2p_addr, population, transport, config_str,
        )
        .await
    }

    /// Creates a replica over a given peer transport. Durable state is opened
    /// and the new generation persisted before any request is served.
    pub async fn new_and_setup_with_transport<T>(
        id: ReplicaId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        population: u8,
        transport: T,
        config_str: Option<&str>,
    ) -> Result<Self, QuorumKvError>
    where
        T: PeerTransport + 'static,
    {
        if population == 0 {
            return logged_err!(id; "invalid population {}", population);
        }
        if id >= population {
            return logged_err!(id; "invalid replica ID {} / {}", id, population);
        }
        if api_addr == p2p_addr {
            return logged_err!(
                id;
                "api_addr and p2p_addr are the same '{}'",
                api_addr
            );
        }

        // parse protocol-specific configs
        let config = parsed_config!(config_str => ReplicaConfigQuorumKv;
                                    wal_dir, read_repair_mode,
                                    peer_timeout_ms, quorum_timeout_ms,
                                    api_chan_cap)?;
        if config.peer_timeout_ms == 0 {
            return logged_err!(
                id;
                "invalid config.peer_timeout_ms '{}'",
                config.peer_timeout_ms
            );
        }
        if config.quorum_timeout_ms == 0 {
            return logged_err!(
                id;
                "invalid config.quorum_timeout_ms '{}'",
                config.quorum_timeout_ms
            );
        }
        if config.api_chan_cap == 0 {
            return logged_err!(
                id;
                "invalid config.api_chan_cap {}",
                config.api_chan_cap
            );
        }
        let api_chan_cap = config.api_chan_cap;

        let transport: Arc<dyn PeerTransport> = Arc::new(transport);
        let node = Arc::new(
            QuorumKvNode::open(id, population, config, transport.clone())
                .await?,
        );

        // start serving peers, then clients
        let peer_server_handle = transport.serve(p2p_addr, node.clone()).await?;
        let external_api = match ExternalApi::new_and_setup(
            id,
            api_addr,
            api_chan_cap,
            api_chan_cap,
        )
        .await
        {
            Ok(api) => api,
            Err(e) => {
                peer_server_handle.abort();
                return Err(e);
            }
        };

        pf_info!(
            id;
            "replica up at generation {}, api '{}', p2p '{}'",
            node.generation(),
            api_addr,
            p2p_addr
        );
        Ok(QuorumKvReplica {
            id,
            node,
            external_api,
            peer_server_handle,
        })
    }

    /// Shared node state, usable for coordinating and inspecting directly.
    pub fn node(&self) -> Arc<QuorumKvNode> {
        self.node.clone()
    }

    /// Main event loop: dispatches each client request to its own task until
    /// the termination signal, then shuts down the servers.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), QuorumKvError> {
        let replier = self.external_api.replier();

        let result = loop {
            tokio::select! {
                // client request
                req = self.external_api.get_req() => {
                    match req {
                        Ok((client, req)) => {
                            tokio::spawn(QuorumKvNode::handle_api_req(
                                self.node.clone(),
                                replier.clone(),
                                client,
                                req,
                            ));
                        }
                        Err(e) => break Err(e),
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Stops serving clients and peers. The node state stays usable through
    /// handles obtained from `node()`.
    pub async fn shutdown(&mut self) {
        self.external_api.shutdown().await;
        self.peer_server_handle.abort();
        let _ = (&mut self.peer_server_handle).await;
        pf_info!(self.id; "replica shut down");
    }
}
