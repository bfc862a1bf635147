//! QuorumKV client API communication stub implementation.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, QuorumKvError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub.
pub struct ClientApiStub {
    /// My client ID.
    id: ClientId,
}

impl ClientApiStub {
    /// Creates a new API connection stub.
    pub fn new(id: ClientId) -> Self {
        ClientApiStub { id }
    }

    /// Connects to the given server address, returning a split pair of owned
    /// read/write halves on success.
    pub async fn connect(
        &self,
        addr: SocketAddr,
    ) -> Result<(ClientSendStub, ClientRecvStub), QuorumKvError> {
        let mut stream = tcp_connect_with_retry(addr, 3).await?;
        stream.write_u64(self.id).await?; // send my client ID

        let (read_half, write_half) = stream.into_split();
        let send_stub = ClientSendStub::new(self.id, write_half);
        let recv_stub = ClientRecvStub::new(self.id, read_half);

        Ok((send_stub, recv_stub))
    }
}

/// Client write stub that owns a TCP write half.
pub struct ClientSendStub {
    /// My client ID.
    id: ClientId,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,
}

impl ClientSendStub {
    /// Creates a new write stub.
    fn new(id: ClientId, conn_write: OwnedWriteHalf) -> Self {
        ClientSendStub { id, conn_write }
    }

    /// Sends a request to established server connection.
    pub async fn send_req(
        &mut self,
        req: ApiRequest,
    ) -> Result<(), QuorumKvError> {
        pf_trace!(self.id; "send req {:?}", req);
        tcp_write_obj(&mut self.conn_write, &req).await
    }
}

/// Client read stub that owns a TCP read half.
pub struct ClientRecvStub {
    /// My client ID.
    id: ClientId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Buffer for partially read replies.
    read_buf: BytesMut,
}

impl ClientRecvStub {
    /// Creates a new read stub.
    fn new(id: ClientId, conn_read: OwnedReadHalf) -> Self {
        ClientRecvStub {
            id,
            conn_read,
            read_buf: BytesMut::with_capacity(8 + 1024),
        }
    }

    /// Receives a reply from established server connection.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, QuorumKvError> {
        let reply = safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await?;
        pf_trace!(self.id; "recv reply {:?}", reply);
        Ok(reply)
    }
}
