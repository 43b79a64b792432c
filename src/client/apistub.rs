//! ShardKV client-side TCP transport to servers' external API.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::cluster::{ServerIdx, Transport};
use crate::server::{ApiReply, ApiRequest};
use crate::utils::{
    tcp_connect_with_retry, tcp_recv_obj, tcp_send_obj, ShardKvError,
};

use async_trait::async_trait;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTransportConfig {
    /// Deadline of one call, connecting included.
    pub rpc_timeout_ms: u64,

    /// Extra connection attempts before a call fails.
    pub connect_retries: u8,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            rpc_timeout_ms: 1000,
            connect_retries: 0,
        }
    }
}

/// Transport that talks to each server over one lazily established TCP
/// connection. Concurrent calls to the same server are serialized on its
/// connection; a connection is dropped after any failure and re-established
/// by the next call.
pub struct TcpTransport {
    /// Map from server index -> (API address, connection slot).
    servers: HashMap<ServerIdx, (SocketAddr, Mutex<Option<TcpStream>>)>,

    /// Configuration parameters struct.
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new transport for the given server addresses. No connection
    /// is made until the first call.
    pub fn new(
        addrs: HashMap<ServerIdx, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, ShardKvError> {
        let config = parsed_config!(config_str => TcpTransportConfig;
                                    rpc_timeout_ms, connect_retries)?;
        if config.rpc_timeout_ms == 0 {
            return Err(ShardKvError(format!(
                "invalid config.rpc_timeout_ms {}",
                config.rpc_timeout_ms
            )));
        }
        if addrs.is_empty() {
            return Err(ShardKvError::msg("servers list is empty"));
        }

        Ok(TcpTransport {
            servers: addrs
                .into_iter()
                .map(|(idx, addr)| (idx, (addr, Mutex::new(None))))
                .collect(),
            config,
        })
    }

    /// Sends one request and waits for its reply on the connection in
    /// `slot`, connecting first if there is none.
    async fn exchange(
        slot: &mut Option<TcpStream>,
        addr: SocketAddr,
        connect_retries: u8,
        req: &ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        if slot.is_none() {
            *slot = Some(tcp_connect_with_retry(addr, connect_retries).await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(ShardKvError(format!("no connection to {}", addr)));
        };

        tcp_send_obj(conn, req).await?;
        match tcp_recv_obj(conn).await? {
            Some(reply) => Ok(reply),
            None => Err(ShardKvError(format!("connection to {} closed", addr))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        server: ServerIdx,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        let Some((addr, slot)) = self.servers.get(&server) else {
            return Err(ShardKvError(format!("unknown server {}", server)));
        };

        let mut conn = slot.lock().await;
        let result = time::timeout(
            Duration::from_millis(self.config.rpc_timeout_ms),
            Self::exchange(&mut conn, *addr, self.config.connect_retries, &req),
        )
        .await;

        match result {
            Ok(Ok(ApiReply::Failed { msg })) => Err(ShardKvError(msg)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            }
            Err(_) => {
                *conn = None;
                Err(ShardKvError(format!(
                    "call to server {} timed out after {} ms",
                    server, self.config.rpc_timeout_ms
                )))
            }
        }
    }
}
