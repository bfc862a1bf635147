//! Safe TCP bind/connect/read/write helper functions.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::QuorumKvError;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the consumed bytes are
///     removed from the read buffer
///   - `Err(err)` if the peer closed the connection or any unexpected error
///     occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and that those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire object (note that
/// such cancellation can only happen at `.await` points), bytes already read
/// are stored in the read buffer and will continue to be appended by future
/// invocations until successful returning.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, QuorumKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // obj_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(QuorumKvError::msg("connection closed by remote"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes);

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(QuorumKvError::msg("connection closed mid-object"));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    read_buf.advance(obj_end);

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`,
/// length-prefixed with an 8-byte big-endian header.
///
/// Not cancellation-safe; callers must not use it as a `tokio::select!`
/// branch.
pub(crate) async fn tcp_write_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), QuorumKvError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Creates a TCP socket of the right address family with common options set.
fn new_socket(addr: SocketAddr) -> Result<TcpSocket, QuorumKvError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_linger(None)?;
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, QuorumKvError> {
    loop {
        let socket = new_socket(bind_addr)?;
        let bound = socket.bind(bind_addr).and_then(|_| socket.listen(1024));

        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 || err.kind() != ErrorKind::AddrInUse {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, QuorumKvError> {
    loop {
        let socket = new_socket(conn_addr)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn framed_send_recv() -> Result<(), QuorumKvError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:53700".parse()?, 3).await?;
        tokio::spawn(async move {
            let mut stream =
                tcp_connect_with_retry("127.0.0.1:53700".parse()?, 3).await?;
            tcp_write_obj(&mut stream, &TestMsg("hello".into())).await?;
            tcp_write_obj(&mut stream, &TestMsg("world".into())).await?;
            Ok::<(), QuorumKvError>(())
        });
        let (mut conn, _) = listener.accept().await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let msg: TestMsg = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert_eq!(msg, TestMsg("hello".into()));
        let msg: TestMsg = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert_eq!(msg, TestMsg("world".into()));
        // writer side dropped, so the next read sees EOF
        assert!(safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut conn)
            .await
            .is_err());
        Ok(())
    }
}
