//! Three-replica in-process cluster scenarios over real localhost sockets,
//! with fault injection on each replica's outbound messages.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{QuorumKvNode, QuorumKvReplica};

use crate::client::KvClient;
use crate::server::faults::{FaultControls, FaultyTransport};
use crate::server::storage::storage_tests::scratch_dir;
use crate::server::transport::{PeerHandler, TcpTransport};
use crate::server::{
    MonotonicId, PeerMsg, PeerReply, PeerReplyMsg, PeerRequest, ReplicaId,
    SetValueResult, StoredValue,
};
use crate::utils::QuorumKvError;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

const PEER_TIMEOUT_MS: u64 = 600;
const QUORUM_TIMEOUT_MS: u64 = 1200;
const INDUCED_DELAY: Duration = Duration::from_millis(250);

const ATHENS: ReplicaId = 0;
const BYZANTIUM: ReplicaId = 1;
const CYRENE: ReplicaId = 2;

struct TestNode {
    node: Arc<QuorumKvNode>,
    faults: FaultControls,
    api_addr: SocketAddr,
    tx_term: watch::Sender<bool>,
    run_handle: JoinHandle<Result<(), QuorumKvError>>,
}

impl TestNode {
    fn client(&self) -> KvClient {
        KvClient::new(self.api_addr).with_timeout(Duration::from_secs(10))
    }
}

struct TestCluster {
    nodes: Vec<TestNode>,
    api_addrs: Vec<SocketAddr>,
    p2p_addrs: Vec<SocketAddr>,
    root: PathBuf,
    mode: &'static str,
}

async fn start_node(
    id: ReplicaId,
    api_addr: SocketAddr,
    p2p_addrs: &[SocketAddr],
    root: &Path,
    mode: &str,
) -> Result<TestNode, QuorumKvError> {
    let transport = FaultyTransport::with_delay(
        id,
        TcpTransport::new(id, p2p_addrs.to_vec())?,
        INDUCED_DELAY,
    );
    let faults = transport.controls();
    let config_str = format!(
        "wal_dir = '{}'\n\
         read_repair_mode = '{}'\n\
         peer_timeout_ms = {}\n\
         quorum_timeout_ms = {}",
        root.join(format!("node{}", id)).display(),
        mode,
        PEER_TIMEOUT_MS,
        QUORUM_TIMEOUT_MS
    );

    let mut replica = QuorumKvReplica::new_and_setup_with_transport(
        id,
        api_addr,
        p2p_addrs[id as usize],
        p2p_addrs.len() as u8,
        transport,
        Some(&config_str),
    )
    .await?;
    let node = replica.node();
    let (tx_term, rx_term) = watch::channel(false);
    let run_handle = tokio::spawn(async move { replica.run(rx_term).await });

    Ok(TestNode {
        node,
        faults,
        api_addr,
        tx_term,
        run_handle,
    })
}

impl TestCluster {
    /// Launches replicas athens, byzantium, cyrene with client ports
    /// `base_port + id` and peer ports `base_port + 10 + id`.
    async fn launch(
        name: &str,
        base_port: u16,
        mode: &'static str,
    ) -> Result<Self, QuorumKvError> {
        Self::launch_in(scratch_dir(name).await, base_port, mode).await
    }

    /// Same as `launch`, over an already prepared root directory.
    async fn launch_in(
        root: PathBuf,
        base_port: u16,
        mode: &'static str,
    ) -> Result<Self, QuorumKvError> {
        let mut api_addrs: Vec<SocketAddr> = vec![];
        let mut p2p_addrs: Vec<SocketAddr> = vec![];
        for id in 0..3u16 {
            api_addrs.push(format!("127.0.0.1:{}", base_port + id).parse()?);
            p2p_addrs.push(format!("127.0.0.1:{}", base_port + 10 + id).parse()?);
        }

        let mut nodes = vec![];
        for id in 0..3u8 {
            nodes.push(
                start_node(id, api_addrs[id as usize], &p2p_addrs, &root, mode)
                    .await?,
            );
        }

        Ok(TestCluster {
            nodes,
            api_addrs,
            p2p_addrs,
            root,
            mode,
        })
    }

    fn node(&self, id: ReplicaId) -> &TestNode {
        &self.nodes[id as usize]
    }

    fn client(&self, id: ReplicaId) -> KvClient {
        self.node(id).client()
    }

    fn faults(&self, id: ReplicaId) -> &FaultControls {
        &self.node(id).faults
    }

    /// Stops replica `id` and starts a new incarnation on the same addresses
    /// and directories. Returns the stopped incarnation, which can still
    /// coordinate on its own.
    async fn restart(
        &mut self,
        id: ReplicaId,
    ) -> Result<Arc<QuorumKvNode>, QuorumKvError> {
        {
            let old = &self.nodes[id as usize];
            old.tx_term.send(true)?;
            // the old incarnation must release its ports first
            while !old.run_handle.is_finished() {
                time::sleep(Duration::from_millis(10)).await;
            }
        }
        let fresh = start_node(
            id,
            self.api_addrs[id as usize],
            &self.p2p_addrs,
            &self.root,
            self.mode,
        )
        .await?;

        let old = std::mem::replace(&mut self.nodes[id as usize], fresh);
        old.run_handle.await??;
        Ok(old.node)
    }
}

fn value_of(value: &StoredValue) -> Option<&str> {
    value.value.as_deref()
}

async fn local_value(
    cluster: &TestCluster,
    id: ReplicaId,
    key: &str,
) -> Option<String> {
    cluster
        .node(id)
        .node
        .local_get(key)
        .await
        .and_then(|v| v.value)
}

/// Polls `check` until it holds or `within` passes.
async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < within {
        if check().await {
            return true;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_read_write() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("quorum_read_write", 54100, "asynchronous").await?;

    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    let value = cluster.client(BYZANTIUM).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));
    assert_eq!(value.generation, 1);

    // a newer write through another coordinator wins on read
    assert_eq!(
        cluster
            .client(CYRENE)
            .set_value("title", "Distributed Systems")
            .await?,
        SetValueResult::Success
    );
    let newer = cluster.client(ATHENS).get_value("title").await?;
    assert_eq!(value_of(&newer), Some("Distributed Systems"));
    assert!(newer.version > value.version);

    // unknown keys read as empty
    assert!(cluster.client(ATHENS).get_value("author").await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_survives_one_unreachable_replica() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("one_unreachable", 54120, "asynchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;

    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    // read-your-own-write through the same coordinator
    let value = cluster.client(ATHENS).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));

    assert_eq!(
        local_value(&cluster, ATHENS, "title").await.as_deref(),
        Some("Microservices")
    );
    assert_eq!(local_value(&cluster, BYZANTIUM, "title").await, None);
    let node = &cluster.node(ATHENS).node;
    assert_eq!(node.version_of("title").await, value.version);
    assert_eq!(node.max_known_generation().await, Some(1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_write_stays_on_minority() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("failed_write", 54140, "asynchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;
    cluster.faults(ATHENS).drop_messages_to(CYRENE).await;

    // one ack out of three is not a quorum
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Error
    );
    assert_eq!(
        local_value(&cluster, ATHENS, "title").await.as_deref(),
        Some("Microservices")
    );

    cluster.faults(ATHENS).reconnect_to(BYZANTIUM).await;
    cluster.faults(ATHENS).reconnect_to(CYRENE).await;

    // a quorum without athens cannot see the value...
    cluster.faults(BYZANTIUM).drop_messages_to(ATHENS).await;
    let value = cluster.client(BYZANTIUM).get_value("title").await?;
    assert!(value.is_empty());

    // ...while one including athens can
    cluster.faults(CYRENE).drop_messages_to(BYZANTIUM).await;
    let value = cluster.client(CYRENE).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_read_repair_converges() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("async_repair", 54160, "asynchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    assert_eq!(local_value(&cluster, BYZANTIUM, "title").await, None);
    cluster.faults(ATHENS).reconnect_to(BYZANTIUM).await;

    // quorum {athens, byzantium}: byzantium is stale
    cluster.faults(BYZANTIUM).drop_messages_to(CYRENE).await;
    let value = cluster.client(BYZANTIUM).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));

    let c = &cluster;
    assert!(
        eventually(Duration::from_secs(3), || async move {
            local_value(c, BYZANTIUM, "title").await.as_deref()
                == Some("Microservices")
        })
        .await
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_diverge_until_repair_lands() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("divergent_reads", 54180, "asynchronous").await?;
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Nicroservices").await?,
        SetValueResult::Success
    );
    let c = &cluster;
    assert!(
        eventually(Duration::from_secs(3), || async move {
            let mut all = true;
            for id in [ATHENS, BYZANTIUM, CYRENE] {
                all &= local_value(c, id, "title").await.is_some();
            }
            all
        })
        .await
    );

    // newer value lands on athens only
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;
    cluster.faults(ATHENS).drop_messages_to(CYRENE).await;
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Error
    );
    cluster.faults(ATHENS).reconnect_to(BYZANTIUM).await;
    cluster.faults(ATHENS).reconnect_to(CYRENE).await;

    // athens reads with byzantium, whose repair is held back
    cluster.faults(ATHENS).drop_messages_to(CYRENE).await;
    cluster
        .faults(ATHENS)
        .add_delay_for_messages_to(BYZANTIUM, 2)
        .await;
    let value = cluster.client(ATHENS).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));

    // cyrene reads with byzantium before the repair arrives
    cluster.faults(CYRENE).drop_messages_to(ATHENS).await;
    let value = cluster.client(CYRENE).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Nicroservices"));

    assert!(
        eventually(Duration::from_secs(3), || async move {
            match c.client(CYRENE).get_value("title").await {
                Ok(v) => value_of(&v) == Some("Microservices"),
                Err(_) => false,
            }
        })
        .await
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_repair_failure_fails_read() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("sync_repair_failure", 54200, "synchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;

    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    let value = cluster.client(ATHENS).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));

    // cyrene reaches byzantium for the read but not for the repair
    cluster.faults(CYRENE).drop_messages_to(ATHENS).await;
    cluster.faults(CYRENE).drop_messages_after(BYZANTIUM, 1).await;
    assert!(cluster.client(CYRENE).get_value("title").await.is_err());
    assert_eq!(local_value(&cluster, BYZANTIUM, "title").await, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_repair_completes_before_reply() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("sync_repair", 54220, "synchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    cluster.faults(ATHENS).reconnect_to(BYZANTIUM).await;

    cluster.faults(BYZANTIUM).drop_messages_to(CYRENE).await;
    let value = cluster.client(BYZANTIUM).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));
    assert_eq!(
        local_value(&cluster, BYZANTIUM, "title").await.as_deref(),
        Some("Microservices")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_coordinator_fences_old_incarnation(
) -> Result<(), QuorumKvError> {
    let mut cluster =
        TestCluster::launch("fencing_restart", 54240, "asynchronous").await?;
    assert_eq!(cluster.node(ATHENS).node.generation(), 1);
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Nicroservices").await?,
        SetValueResult::Success
    );

    let zombie = cluster.restart(ATHENS).await?;
    assert_eq!(zombie.generation(), 1);
    let athens = cluster.node(ATHENS).node.clone();
    assert_eq!(athens.generation(), 2);
    // durable data survives the restart
    assert_eq!(
        athens.local_get("title").await.and_then(|v| v.value).as_deref(),
        Some("Nicroservices")
    );

    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Success
    );
    assert_eq!(athens.max_known_generation().await, Some(2));
    let c = &cluster;
    assert!(
        eventually(Duration::from_secs(3), || async move {
            let mut all = true;
            for id in [BYZANTIUM, CYRENE] {
                all &= c.node(id).node.accepted_generation().await == 2;
            }
            all
        })
        .await
    );

    // the superseded incarnation is rejected everywhere
    let err = zombie.write("title", "Stale".into()).await.unwrap_err();
    assert!(matches!(err, QuorumKvError::QuorumNotReached { acked: 0, .. }));
    assert!(zombie.read("title").await.is_err());

    // the threshold is node-wide: other coordinators still at generation 1
    // are refused as well
    assert!(cluster.client(BYZANTIUM).get_value("title").await.is_err());

    let value = cluster.client(ATHENS).get_value("title").await?;
    assert_eq!(value_of(&value), Some("Microservices"));
    assert_eq!(value.generation, 2);
    for id in [BYZANTIUM, CYRENE] {
        assert_ne!(
            local_value(&cluster, id, "title").await.as_deref(),
            Some("Stale")
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_resolve_by_version() -> Result<(), QuorumKvError> {
    let cluster =
        TestCluster::launch("concurrent_writers", 54260, "asynchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;
    cluster.faults(ATHENS).drop_messages_to(CYRENE).await;

    // athens keeps its failed write locally
    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Nitroservices").await?,
        SetValueResult::Error
    );
    assert_eq!(
        local_value(&cluster, ATHENS, "title").await.as_deref(),
        Some("Nitroservices")
    );
    assert_eq!(local_value(&cluster, BYZANTIUM, "title").await, None);
    assert_eq!(local_value(&cluster, CYRENE, "title").await, None);

    // alice reads through cyrene, whose quorum has not seen it
    let alice_read = cluster.client(CYRENE).get_value("title").await?;
    assert!(alice_read.is_empty());

    // bob writes through athens once it is reconnected...
    cluster.faults(ATHENS).reconnect_to(BYZANTIUM).await;
    cluster.faults(ATHENS).reconnect_to(CYRENE).await;
    let bob_version = cluster
        .node(ATHENS)
        .node
        .write("title", "Distributed Systems".into())
        .await?;

    // ...while alice, still trusting her empty read, writes through cyrene
    let alice_version = cluster
        .node(CYRENE)
        .node
        .write("title", "Nitroservices".into())
        .await?;
    assert_ne!(alice_version, bob_version);

    // both succeeded; the greater version wins on read
    let (winner, version) = if alice_version > bob_version {
        ("Nitroservices", alice_version)
    } else {
        ("Distributed Systems", bob_version)
    };
    let value = cluster.client(CYRENE).get_value("title").await?;
    assert_eq!(value_of(&value), Some(winner));
    assert_eq!(value.version, version);
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_persist_failure_is_not_acked() -> Result<(), QuorumKvError> {
    let root = scratch_dir("local_persist_failure").await;
    let cyrene_dir = root.join(format!("node{}", CYRENE));
    tokio::fs::create_dir_all(&cyrene_dir).await?;
    tokio::fs::symlink("/dev/full", cyrene_dir.join("data.wal")).await?;

    let cluster = TestCluster::launch_in(root, 54280, "asynchronous").await?;
    cluster.faults(ATHENS).drop_messages_to(BYZANTIUM).await;

    // cyrene answers but cannot persist, leaving athens alone
    let err = cluster
        .node(ATHENS)
        .node
        .write("title", "Microservices".into())
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumKvError::QuorumNotReached { acked: 1, .. }));
    assert_eq!(local_value(&cluster, CYRENE, "title").await, None);

    // the failure is reported back, not dropped
    let reply = cluster
        .node(CYRENE)
        .node
        .handle_peer_msg(PeerMsg {
            id: 7,
            from: ATHENS,
            generation: 1,
            req: PeerRequest::ReplicateWrite {
                key: "title".into(),
                stored_value: StoredValue::new(
                    "Microservices".into(),
                    MonotonicId::new(1, 1),
                ),
            },
        })
        .await;
    assert!(matches!(
        reply,
        Some(PeerReplyMsg {
            id: 7,
            reply: PeerReply::LocalFailure { .. },
            ..
        })
    ));

    assert_eq!(
        cluster.client(ATHENS).set_value("title", "Microservices").await?,
        SetValueResult::Error
    );
    Ok(())
}
