//! Fault-injection transport decorator for partition tests.
//!
//! Wraps any `PeerTransport` and applies per-peer drop/delay rules to the
//! messages this node sends: outbound requests issued through `call()`, and
//! replies produced by the handler registered through `serve()`. Rules are
//! per ordered pair (this node -> peer) and compose freely across peers.
//!
//! A dropped request never completes, exactly like a message lost on the
//! wire; the caller's own deadline is what ends the wait. A dropped reply
//! closes the connection without answering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::transport::{PeerHandler, PeerTransport};
use crate::server::{PeerMsg, PeerReplyMsg, ReplicaId};
use crate::utils::QuorumKvError;

use async_trait::async_trait;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Default induced delay for `add_delay_for_messages_to`.
const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

/// Fault rules towards one peer.
#[derive(Debug, Default, Clone, Copy)]
struct PeerFaults {
    /// Drop everything.
    dropped: bool,

    /// Number of messages still allowed through before dropping everything.
    allowed: Option<usize>,

    /// Number of upcoming messages to deliver late.
    delayed: usize,
}

impl PeerFaults {
    #[inline]
    fn cut_off(&self) -> bool {
        self.dropped || self.allowed == Some(0)
    }
}

/// What happens to one outbound message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Fate {
    Deliver,
    Delay(Duration),
    Drop,
}

/// Shared fault table, consulted by both the calling and serving sides.
struct FaultTable {
    me: ReplicaId,
    delay: Duration,
    rules: Mutex<HashMap<ReplicaId, PeerFaults>>,
}

impl FaultTable {
    /// Decides the fate of the next message to `peer`, consuming one unit of
    /// any message-count rule.
    async fn next_fate(&self, peer: ReplicaId) -> Fate {
        let mut rules = self.rules.lock().await;
        let Some(faults) = rules.get_mut(&peer) else {
            return Fate::Deliver;
        };

        if faults.cut_off() {
            return Fate::Drop;
        }
        if let Some(allowed) = faults.allowed.as_mut() {
            *allowed -= 1;
        }
        if faults.delayed > 0 {
            faults.delayed -= 1;
            return Fate::Delay(self.delay);
        }
        Fate::Deliver
    }

    /// Whether `peer` is currently fully cut off from me.
    async fn cut_off(&self, peer: ReplicaId) -> bool {
        self.rules
            .lock()
            .await
            .get(&peer)
            .is_some_and(|faults| faults.cut_off())
    }
}

/// Transport decorator with fault-injection controls.
pub struct FaultyTransport<T> {
    inner: T,
    table: Arc<FaultTable>,
}

impl<T> FaultyTransport<T>
where
    T: PeerTransport,
{
    /// Wraps `inner` with no faults active.
    pub fn new(me: ReplicaId, inner: T) -> Self {
        Self::with_delay(me, inner, DEFAULT_DELAY)
    }

    /// Wraps `inner`, using `delay` for delayed messages.
    pub fn with_delay(me: ReplicaId, inner: T, delay: Duration) -> Self {
        FaultyTransport {
            inner,
            table: Arc::new(FaultTable {
                me,
                delay,
                rules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a cloneable control handle sharing this decorator's rules.
    pub fn controls(&self) -> FaultControls {
        FaultControls {
            table: self.table.clone(),
        }
    }
}

/// Handle for changing fault rules after the transport has been handed to a
/// replica.
#[derive(Clone)]
pub struct FaultControls {
    table: Arc<FaultTable>,
}

impl FaultControls {
    /// Discards every subsequent message between me and `peer`, in both
    /// directions, until `reconnect_to(peer)`.
    pub async fn drop_messages_to(&self, peer: ReplicaId) {
        let mut rules = self.table.rules.lock().await;
        rules.entry(peer).or_default().dropped = true;
        pf_info!(self.table.me; "dropping messages to {}", peer);
    }

    /// Lets the next `n` messages to `peer` through, then discards all.
    pub async fn drop_messages_after(&self, peer: ReplicaId, n: usize) {
        let mut rules = self.table.rules.lock().await;
        rules.entry(peer).or_default().allowed = Some(n);
        pf_info!(self.table.me; "dropping messages to {} after {}", peer, n);
    }

    /// Delivers the next `n` messages to `peer` late.
    pub async fn add_delay_for_messages_to(&self, peer: ReplicaId, n: usize) {
        let mut rules = self.table.rules.lock().await;
        rules.entry(peer).or_default().delayed += n;
        pf_info!(
            self.table.me;
            "delaying next {} messages to {} by {} ms",
            n,
            peer,
            self.table.delay.as_millis()
        );
    }

    /// Clears all drop/delay rules towards `peer`.
    pub async fn reconnect_to(&self, peer: ReplicaId) {
        self.table.rules.lock().await.remove(&peer);
        pf_info!(self.table.me; "reconnected to {}", peer);
    }
}

#[async_trait]
impl<T> PeerTransport for FaultyTransport<T>
where
    T: PeerTransport,
{
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<PeerReplyMsg, QuorumKvError> {
        match self.table.next_fate(peer).await {
            Fate::Deliver => {}
            Fate::Delay(delay) => time::sleep(delay).await,
            Fate::Drop => {
                pf_debug!(self.table.me; "dropped request {} to {}", msg.id, peer);
                return futures::future::pending().await;
            }
        }
        self.inner.call(peer, msg).await
    }

    async fn serve(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<JoinHandle<()>, QuorumKvError> {
        let faulty = FaultyHandler {
            inner: handler,
            table: self.table.clone(),
        };
        self.inner.serve(bind_addr, Arc::new(faulty)).await
    }
}

/// Serving-side wrapper applying the same rules to inbound requests and the
/// replies going back.
struct FaultyHandler {
    inner: Arc<dyn PeerHandler>,
    table: Arc<FaultTable>,
}

#[async_trait]
impl PeerHandler for FaultyHandler {
    async fn handle_peer_msg(&self, msg: PeerMsg) -> Option<PeerReplyMsg> {
        let peer = msg.from;
        if self.table.cut_off(peer).await {
            pf_debug!(self.table.me; "ignored request {} from {}", msg.id, peer);
            return None;
        }

        let reply = self.inner.handle_peer_msg(msg).await?;
        match self.table.next_fate(peer).await {
            Fate::Deliver => Some(reply),
            Fate::Delay(delay) => {
                time::sleep(delay).await;
                Some(reply)
            }
            Fate::Drop => {
                pf_debug!(self.table.me; "dropped reply {} to {}", reply.id, peer);
                None
            }
        }
    }
}
