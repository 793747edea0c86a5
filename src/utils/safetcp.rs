//! Safe TCP bind/connect/read/write helper functions.
//!
//! Every exchange in causalkv is a single request/reply pair over a fresh
//! connection. Objects are MessagePack-encoded and framed by a big-endian
//! `u64` length prefix.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::BytesMut;
use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::CausalKvError;

/// Upper limit on the length of a single frame. Anything larger is treated
/// as a corrupted length prefix.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Receives an object of type `T` from TCP readable connection `conn_read`.
pub(crate) async fn safe_tcp_read<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, CausalKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    let obj_len = conn_read.read_u64().await?;
    if obj_len > MAX_FRAME_LEN {
        return Err(CausalKvError::msg(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    // then read the obj itself
    #[allow(clippy::cast_possible_truncation)]
    let obj_len = obj_len as usize;
    let mut read_buf = BytesMut::with_capacity(obj_len);
    while read_buf.len() < obj_len {
        if conn_read.read_buf(&mut read_buf).await? == 0 {
            return Err(CausalKvError::msg(format!(
                "connection closed after {} / {} bytes",
                read_buf.len(),
                obj_len
            )));
        }
    }

    let obj = decode_from_slice(&read_buf[..obj_len])?;
    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`.
pub(crate) async fn safe_tcp_write<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), CausalKvError>
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

/// Opens a fresh connection to `conn_addr` (`host:port`), sends `req`, waits
/// for exactly one reply, and closes the connection.
pub(crate) async fn tcp_request<Req, Rep>(
    conn_addr: &str,
    req: &Req,
) -> Result<Rep, CausalKvError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let mut stream = TcpStream::connect(conn_addr).await?;
    stream.set_nodelay(true)?;
    safe_tcp_write(&mut stream, req).await?;
    let rep = safe_tcp_read(&mut stream).await?;
    let _ = stream.shutdown().await; // peer may have closed already
    Ok(rep)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, CausalKvError> {
    loop {
        let socket = match bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum TestMsg {
        Ping(String),
        Pong(u64),
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_reply() -> Result<(), CausalKvError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:53700".parse()?, 3).await?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let req: TestMsg = safe_tcp_read(&mut stream).await?;
            assert_eq!(req, TestMsg::Ping("hello".into()));
            safe_tcp_write(&mut stream, &TestMsg::Pong(7)).await?;
            Ok::<(), CausalKvError>(())
        });
        let rep: TestMsg =
            tcp_request("127.0.0.1:53700", &TestMsg::Ping("hello".into()))
                .await?;
        assert_eq!(rep, TestMsg::Pong(7));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_refused() {
        let rep: Result<TestMsg, _> =
            tcp_request("127.0.0.1:1", &TestMsg::Pong(0)).await;
        assert!(rep.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_frame() -> Result<(), CausalKvError> {
        let mut bytes: &[u8] = &u64::MAX.to_be_bytes();
        let res: Result<TestMsg, _> = safe_tcp_read(&mut bytes).await;
        assert!(res.is_err());
        Ok(())
    }
}
