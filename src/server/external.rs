//! ShardKV server external API: wire messages and TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::cluster::ServerIdx;
use crate::server::{Command, KvServer, Version};
use crate::utils::{
    tcp_bind_with_retry, tcp_recv_obj, tcp_send_obj, ShardKvError,
};

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Per-client write sequence number type.
pub type SeqId = u64;

/// Kind of write operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum WriteOp {
    Put,
    Append,
}

/// Arguments of a Put or Append call. `(client, seq)` identifies the write
/// for duplicate suppression; retries of one logical write reuse both.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub op: WriteOp,
    pub key: String,
    pub value: String,
    pub client: ClientId,
    pub seq: SeqId,
}

impl PutAppendArgs {
    /// Store command this write applies.
    pub fn to_command(&self) -> Command {
        match self.op {
            WriteOp::Put => Command::Put {
                key: self.key.clone(),
                value: self.value.clone(),
            },
            WriteOp::Append => Command::Append {
                key: self.key.clone(),
                value: self.value.clone(),
            },
        }
    }
}

/// Why a server refused to accept a write.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum RefuseReason {
    /// This server, or a replica of the key's group, is not live.
    NodeDown,

    /// The key's primary is not live.
    PrimaryDown,
}

/// Request sent to a server, by a clerk or by a peer server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Read the current value of key.
    Get { key: String },

    /// Put or Append, possibly forwarded verbatim by a non-primary.
    PutAppend(PutAppendArgs),

    /// Primary -> replica state push of a key's new value, tagged with the
    /// primary's version of the key.
    Replicate {
        key: String,
        value: String,
        version: Version,
    },
}

/// Reply from a server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Current value, empty if the key is absent.
    Get { value: String },

    /// The server is not in the key's replica group.
    WrongShard,

    /// The write was applied (now or earlier); carries the value the key
    /// held before the write.
    PutAppend { old_value: String },

    /// Acknowledges a replica push.
    Replicated,

    /// The write was refused and left no trace.
    Refused { reason: RefuseReason },

    /// The server hit a transport failure while serving the request, e.g.
    /// while forwarding it to the primary.
    Failed { msg: String },
}

/// The external client-facing API module of one server: accepts TCP
/// connections and serves framed requests against a `KvServer`.
pub struct ExternalApi {
    /// My server index.
    me: ServerIdx,

    /// Address actually bound, known after setup.
    local_addr: Option<SocketAddr>,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: Option<JoinHandle<()>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module.
    pub fn new(me: ServerIdx) -> Self {
        ExternalApi {
            me,
            local_addr: None,
            client_acceptor_handle: None,
        }
    }

    /// Binds a TCP listener on `api_addr` and spawns the client acceptor
    /// thread serving `server`. Returns the bound address, which differs from
    /// `api_addr` if port 0 was given.
    pub async fn setup(
        &mut self,
        server: Arc<KvServer>,
        api_addr: SocketAddr,
    ) -> Result<SocketAddr, ShardKvError> {
        if self.client_acceptor_handle.is_some() {
            return logged_err!(self.me; "setup already done");
        }
        if server.id() != self.me {
            return logged_err!(
                self.me;
                "cannot serve server {} from api of {}",
                server.id(),
                self.me
            );
        }

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let local_addr = client_listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let client_acceptor_handle = tokio::spawn(
            Self::client_acceptor_thread(self.me, client_listener, server),
        );
        self.client_acceptor_handle = Some(client_acceptor_handle);

        pf_info!(self.me; "accepting clients on {}", local_addr);
        Ok(local_addr)
    }

    /// Address the listener is bound to, if set up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

// ExternalApi client acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        me: ServerIdx,
        client_listener: TcpListener,
        server: Arc<KvServer>,
    ) {
        pf_debug!(me; "client_acceptor thread spawned");

        loop {
            match client_listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(me; "accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        pf_warn!(me; "error setting nodelay: {}", e);
                    }
                    tokio::spawn(Self::client_servant_thread(
                        me,
                        stream,
                        addr,
                        server.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!(me; "error accepting connection: {}", e);
                }
            }
        }
    }

    /// Client request servant thread function. Serves one request at a time
    /// until the peer closes the connection.
    async fn client_servant_thread(
        me: ServerIdx,
        mut conn: TcpStream,
        addr: SocketAddr,
        server: Arc<KvServer>,
    ) {
        let (mut conn_read, mut conn_write) = conn.split();

        loop {
            let req: ApiRequest = match tcp_recv_obj(&mut conn_read).await {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    pf_warn!(me; "error reading request from {}: {}", addr, e);
                    break;
                }
            };

            let reply = match server.handle_req(req).await {
                Ok(reply) => reply,
                Err(e) => ApiReply::Failed { msg: e.to_string() },
            };

            if let Err(e) = tcp_send_obj(&mut conn_write, &reply).await {
                pf_warn!(me; "error sending reply to {}: {}", addr, e);
                break;
            }
        }

        pf_debug!(me; "connection from {} closed", addr);
    }
}

impl Drop for ExternalApi {
    fn drop(&mut self) {
        if let Some(handle) = self.client_acceptor_handle.take() {
            handle.abort();
        }
    }
}
