//! QuorumKV server external API module implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest, ReplicaId};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, QuorumKvError,
};

use bytes::BytesMut;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Map from client ID -> sender side of its reply channel.
type ReplyChannels = Arc<Mutex<HashMap<ClientId, mpsc::Sender<ApiReply>>>>;

/// Map from client ID -> client servant thread join handle.
type ServantHandles = Arc<Mutex<HashMap<ClientId, JoinHandle<()>>>>;

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::Receiver<(ClientId, ApiRequest)>,

    /// Reply channels of connected clients, shared with the client acceptor
    /// thread.
    tx_replies: ReplyChannels,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: JoinHandle<()>,

    /// Client servant thread join handles, shared with the client acceptor
    /// thread.
    client_servant_handles: ServantHandles,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module. Spawns the client acceptor thread
    /// listening on `api_addr`. Creates a req channel for buffering incoming
    /// client requests and a reply channel per client for sending back
    /// replies.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        chan_req_cap: usize,
        chan_reply_cap: usize,
    ) -> Result<Self, QuorumKvError> {
        if chan_req_cap == 0 {
            return logged_err!(me; "invalid chan_req_cap {}", chan_req_cap);
        }
        if chan_reply_cap == 0 {
            return logged_err!(me; "invalid chan_reply_cap {}", chan_reply_cap);
        }

        let (tx_req, rx_req) = mpsc::channel(chan_req_cap);
        let tx_replies: ReplyChannels = Arc::new(Mutex::new(HashMap::new()));
        let client_servant_handles: ServantHandles =
            Arc::new(Mutex::new(HashMap::new()));

        let client_listener = tcp_bind_with_retry(api_addr, 15).await?;
        let client_acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(
                me,
                tx_req,
                chan_reply_cap,
                client_listener,
                tx_replies.clone(),
                client_servant_handles.clone(),
            ));

        Ok(ExternalApi {
            me,
            rx_req,
            tx_replies,
            client_acceptor_handle,
            client_servant_handles,
        })
    }

    /// Waits for the next client request.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), QuorumKvError> {
        match self.rx_req.recv().await {
            Some(req) => Ok(req),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Returns a cloneable handle for sending replies from request tasks.
    pub(crate) fn replier(&self) -> ApiReplier {
        ApiReplier {
            me: self.me,
            tx_replies: self.tx_replies.clone(),
        }
    }

    /// Stops accepting clients and closes all client connections.
    pub(crate) async fn shutdown(&mut self) {
        self.client_acceptor_handle.abort();
        let _ = (&mut self.client_acceptor_handle).await; // listener dropped
        for (_, handle) in self.client_servant_handles.lock().await.drain() {
            handle.abort();
        }
        self.tx_replies.lock().await.clear();
        pf_debug!(self.me; "external API shut down");
    }
}

/// Handle for sending replies back to clients.
#[derive(Clone)]
pub(crate) struct ApiReplier {
    me: ReplicaId,
    tx_replies: ReplyChannels,
}

impl ApiReplier {
    /// Sends a reply back to client by sending to its reply channel.
    pub(crate) async fn send_reply(
        &self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), QuorumKvError> {
        let tx_reply = self.tx_replies.lock().await.get(&client).cloned();
        match tx_reply {
            Some(tx_reply) => {
                tx_reply.send(reply).await?;
                Ok(())
            }
            None => {
                logged_err!(
                    self.me;
                    "client ID {} not found among active clients",
                    client
                )
            }
        }
    }
}

// ExternalApi client_acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        me: ReplicaId,
        tx_req: mpsc::Sender<(ClientId, ApiRequest)>,
        chan_reply_cap: usize,
        client_listener: TcpListener,
        tx_replies: ReplyChannels,
        client_servant_handles: ServantHandles,
    ) {
        pf_debug!(me; "client_acceptor thread spawned");
        if let Ok(local_addr) = client_listener.local_addr() {
            pf_info!(me; "accepting clients on '{}'", local_addr);
        }

        loop {
            let (mut stream, addr) = match client_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(me; "error accepting client connection: {}", e);
                    continue;
                }
            };

            let id = match stream.read_u64().await {
                Ok(id) => id, // receive client ID
                Err(e) => {
                    pf_error!(me; "error receiving new client ID: {}", e);
                    continue;
                }
            };

            let mut tx_replies_guard = tx_replies.lock().await;
            let mut handles_guard = client_servant_handles.lock().await;
            if let Some(sender) = tx_replies_guard.get(&id) {
                if sender.is_closed() {
                    // if this client ID has left before, garbage collect it now
                    handles_guard.remove(&id);
                    tx_replies_guard.remove(&id);
                } else {
                    pf_error!(me; "duplicate client ID listened: {}", id);
                    continue;
                }
            }
            pf_debug!(me; "accepted new client {}", id);

            let (tx_reply, rx_reply) = mpsc::channel(chan_reply_cap);
            tx_replies_guard.insert(id, tx_reply);

            let client_servant_handle =
                tokio::spawn(Self::client_servant_thread(
                    me,
                    id,
                    addr,
                    stream,
                    tx_req.clone(),
                    rx_reply,
                ));
            handles_guard.insert(id, client_servant_handle);
        }
    }
}

// ExternalApi client_servant thread implementation
impl ExternalApi {
    /// Client request listener and reply sender thread function.
    async fn client_servant_thread(
        me: ReplicaId,
        id: ClientId,
        addr: SocketAddr,
        mut conn: TcpStream,
        tx_req: mpsc::Sender<(ClientId, ApiRequest)>,
        mut rx_reply: mpsc::Receiver<ApiReply>,
    ) {
        pf_debug!(me; "client_servant thread for {} ({}) spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and receiving
                // new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = tcp_write_obj(&mut conn_write, &reply).await {
                                pf_error!(me; "error replying to {}: {}", id, e);
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // receives client request
                req = safe_tcp_read(&mut req_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            pf_trace!(me; "request from {} req {:?}", id, req);
                            if let Err(e) = tx_req.send((id, req)).await {
                                pf_error!(
                                    me; "error sending to tx_req for {}: {}", id, e
                                );
                            }
                        },

                        Err(_) => break, // client done with this connection
                    }
                },
            }
        }

        // release the reply channel so that the client ID may be reused
        rx_reply.close();
        pf_debug!(me; "client_servant thread for {} ({}) exitted", id, addr);
    }
}
