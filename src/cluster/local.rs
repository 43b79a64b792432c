//! In-process transport and cluster: every server lives in the current
//! process and calls are plain async function calls.

use std::sync::{Arc, OnceLock, Weak};

use crate::client::Clerk;
use crate::cluster::{
    ClusterConfig, Liveness, LivenessMap, ServerIdx, ShardRouter, Transport,
};
use crate::server::{ApiReply, ApiRequest, KvServer};
use crate::utils::ShardKvError;

use async_trait::async_trait;

/// In-process transport. A call to a server the liveness oracle reports
/// down fails as unreachable, the way a crashed or partitioned process
/// would.
pub struct LocalNetwork {
    liveness: Arc<dyn Liveness>,

    /// Servers indexed by `ServerIdx`, held weakly since each server also
    /// holds this network.
    servers: OnceLock<Vec<Weak<KvServer>>>,
}

impl LocalNetwork {
    /// Creates a network with no servers attached yet.
    pub fn new(liveness: Arc<dyn Liveness>) -> Self {
        LocalNetwork {
            liveness,
            servers: OnceLock::new(),
        }
    }

    /// Attaches the servers, in index order. Can only be done once.
    pub fn attach(&self, servers: &[Arc<KvServer>]) -> Result<(), ShardKvError> {
        for (idx, server) in servers.iter().enumerate() {
            if server.id() as usize != idx {
                return Err(ShardKvError(format!(
                    "server {} attached at position {}",
                    server.id(),
                    idx
                )));
            }
        }
        self.servers
            .set(servers.iter().map(Arc::downgrade).collect())
            .map_err(|_| ShardKvError::msg("servers already attached"))
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn call(
        &self,
        server: ServerIdx,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        if !self.liveness.is_up(server) {
            return Err(ShardKvError(format!("server {} unreachable", server)));
        }

        let target = self
            .servers
            .get()
            .and_then(|servers| servers.get(server as usize))
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                ShardKvError(format!("server {} not attached", server))
            })?;
        target.handle_req(req).await
    }
}

/// A whole cluster of `KvServer`s in this process, sharing one liveness
/// oracle and one `LocalNetwork`.
pub struct LocalCluster {
    router: ShardRouter,
    liveness: Arc<LivenessMap>,
    network: Arc<LocalNetwork>,
    servers: Vec<Arc<KvServer>>,
}

impl LocalCluster {
    /// Builds `config.nservers` servers, all initially up.
    pub fn new(config: ClusterConfig) -> Result<Self, ShardKvError> {
        let router = ShardRouter::new(&config)?;
        let liveness = Arc::new(LivenessMap::new(config.nservers)?);
        let network = Arc::new(LocalNetwork::new(liveness.clone()));

        let servers = (0..config.nservers)
            .map(|me| {
                KvServer::new(me, router, liveness.clone(), network.clone())
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        network.attach(&servers)?;

        Ok(LocalCluster {
            router,
            liveness,
            network,
            servers,
        })
    }

    #[inline]
    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Gets server by index.
    pub fn server(&self, idx: ServerIdx) -> Option<&Arc<KvServer>> {
        self.servers.get(idx as usize)
    }

    /// All servers in index order.
    pub fn servers(&self) -> &[Arc<KvServer>] {
        &self.servers
    }

    /// The shared liveness oracle.
    pub fn liveness(&self) -> &Arc<LivenessMap> {
        &self.liveness
    }

    /// The shared in-process transport.
    pub fn network(&self) -> Arc<LocalNetwork> {
        self.network.clone()
    }

    /// Marks a server up or down in the shared oracle.
    pub fn set_up(
        &self,
        idx: ServerIdx,
        up: bool,
    ) -> Result<(), ShardKvError> {
        self.liveness.set_up(idx, up)
    }

    /// Creates a clerk talking to this cluster over the local network.
    pub fn clerk(&self, config_str: Option<&str>) -> Result<Clerk, ShardKvError> {
        Clerk::new(self.router, self.network.clone(), config_str)
    }
}
