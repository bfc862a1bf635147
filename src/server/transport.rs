//! Server internal peer-to-peer transport module.
//!
//! Peer requests use one short-lived TCP connection per call: the caller
//! connects, writes a framed `PeerMsg`, and waits for the framed
//! `PeerReplyMsg`. A serving side that decides not to answer simply closes
//! the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::{PeerMsg, PeerReplyMsg, ReplicaId};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
    QuorumKvError,
};

use async_trait::async_trait;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Receiver side of peer requests, implemented by the replica.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Handles one peer request. Returning `None` means no reply is sent.
    async fn handle_peer_msg(&self, msg: PeerMsg) -> Option<PeerReplyMsg>;
}

/// Request/response transport between replicas.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Sends `msg` to replica `peer` and waits for its reply. Carries no
    /// deadline of its own; callers bound it.
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<PeerReplyMsg, QuorumKvError>;

    /// Starts serving peer requests on `bind_addr`, dispatching each to
    /// `handler`. Returns the join handle of the acceptor thread once the
    /// listener is bound.
    async fn serve(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<JoinHandle<()>, QuorumKvError>;
}

/// Production TCP transport.
pub struct TcpTransport {
    /// My replica ID.
    me: ReplicaId,

    /// Peer-facing addresses of all replicas, indexed by replica ID.
    peer_addrs: Vec<SocketAddr>,
}

impl TcpTransport {
    /// Creates a new TCP transport for replica `me`.
    pub fn new(
        me: ReplicaId,
        peer_addrs: Vec<SocketAddr>,
    ) -> Result<Self, QuorumKvError> {
        if peer_addrs.is_empty() || peer_addrs.len() > u8::MAX as usize {
            return logged_err!(
                me;
                "invalid number of replicas {}",
                peer_addrs.len()
            );
        }
        if me as usize >= peer_addrs.len() {
            return logged_err!(me; "invalid replica ID {}", me);
        }
        Ok(TcpTransport { me, peer_addrs })
    }

    /// Cluster size.
    #[inline]
    pub fn population(&self) -> u8 {
        self.peer_addrs.len() as u8
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<PeerReplyMsg, QuorumKvError> {
        let addr = match self.peer_addrs.get(peer as usize) {
            Some(addr) => *addr,
            None => return logged_err!(self.me; "unknown peer ID {}", peer),
        };

        let mut stream = tcp_connect_with_retry(addr, 0).await?;
        tcp_write_obj(&mut stream, &msg).await?;

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let reply: PeerReplyMsg =
            safe_tcp_read(&mut read_buf, &mut stream).await?;
        if reply.id != msg.id {
            return logged_err!(
                self.me;
                "reply ID mismatch from {}: expect {} got {}",
                peer,
                msg.id,
                reply.id
            );
        }
        Ok(reply)
    }

    async fn serve(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<JoinHandle<()>, QuorumKvError> {
        let listener = tcp_bind_with_retry(bind_addr, 15).await?;
        Ok(tokio::spawn(Self::peer_acceptor_thread(
            self.me, listener, handler,
        )))
    }
}

// TcpTransport peer_acceptor thread implementation
impl TcpTransport {
    /// Peer acceptor thread function.
    async fn peer_acceptor_thread(
        me: ReplicaId,
        listener: TcpListener,
        handler: Arc<dyn PeerHandler>,
    ) {
        pf_debug!(me; "peer_acceptor thread spawned");
        if let Ok(local_addr) = listener.local_addr() {
            pf_info!(me; "accepting peers on '{}'", local_addr);
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(me; "error accepting peer connection: {}", e);
                    continue;
                }
            };

            tokio::spawn(Self::peer_servant_thread(
                me,
                addr,
                stream,
                handler.clone(),
            ));
        }
    }

    /// Per-connection peer request servant thread function. Serves requests
    /// until the caller closes the connection or the handler declines to
    /// reply.
    async fn peer_servant_thread(
        me: ReplicaId,
        addr: SocketAddr,
        mut conn: TcpStream,
        handler: Arc<dyn PeerHandler>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            let msg: PeerMsg = match safe_tcp_read(&mut read_buf, &mut conn).await
            {
                Ok(msg) => msg,
                Err(_) => break, // caller done with this connection
            };
            pf_trace!(me; "peer request from {} ({}): {:?}", msg.from, addr, msg);

            match handler.handle_peer_msg(msg).await {
                Some(reply) => {
                    if let Err(e) = tcp_write_obj(&mut conn, &reply).await {
                        pf_warn!(me; "error replying to peer at {}: {}", addr, e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
}
