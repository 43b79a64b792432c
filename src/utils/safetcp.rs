//! Length-prefixed TCP framing and bind/connect helper functions.
//!
//! Every message on the wire is a big-endian `u64` length followed by the
//! MessagePack encoding of the object.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::ShardKvError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Upper bound on the length of a single framed object.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Sends an object of type `T` to TCP writable connection `conn_write`.
pub(crate) async fn tcp_send_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), ShardKvError>
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

/// Receives an object of type `T` from TCP readable connection `conn_read`.
/// Returns `Ok(None)` if the peer closed the connection cleanly before a new
/// object started.
pub(crate) async fn tcp_recv_obj<T, Conn>(
    conn_read: &mut Conn,
) -> Result<Option<T>, ShardKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = match conn_read.read_u64().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if obj_len > MAX_FRAME_LEN {
        return Err(ShardKvError(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    Ok(Some(decode_from_slice(&obj_buf)?))
}

/// Wrapper over tokio `TcpListener` binding that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ShardKvError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, ShardKvError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
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
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_recv_objs() -> Result<(), ShardKvError> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut obj = HashMap::new();
        obj.insert("4".to_string(), "x".to_string());

        tcp_send_obj(&mut client, &obj).await?;
        tcp_send_obj(&mut client, &7u64).await?;
        let got: Option<HashMap<String, String>> =
            tcp_recv_obj(&mut server).await?;
        assert_eq!(got, Some(obj));
        assert_eq!(tcp_recv_obj::<u64, _>(&mut server).await?, Some(7));

        drop(client);
        assert_eq!(tcp_recv_obj::<u64, _>(&mut server).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recv_oversized_frame() -> Result<(), ShardKvError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u64(MAX_FRAME_LEN + 1).await?;
        assert!(tcp_recv_obj::<u64, _>(&mut server).await.is_err());
        Ok(())
    }
}
