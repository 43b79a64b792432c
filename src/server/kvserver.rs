//! ShardKV server node: shard ownership resolution, write forwarding, at-most
//! once application, and primary -> replica state push.

use std::fmt;
use std::sync::Arc;

use crate::cluster::{Liveness, ServerIdx, ShardRouter, Transport};
use crate::server::{
    ApiReply, ApiRequest, DedupTable, KvStore, PutAppendArgs, RefuseReason,
    Version,
};
use crate::utils::ShardKvError;

use futures::future::join_all;

use tokio::sync::Mutex;

/// State owned by one server, always accessed under a single lock.
#[derive(Debug, Default)]
struct ServerState {
    /// Key-value data, mutated by the primary path or by replica pushes.
    store: KvStore,

    /// Last applied write of each client for which I acted as primary.
    dedup: DedupTable,
}

/// One node of the cluster. Serves Gets for keys whose replica group it
/// belongs to, accepts writes for keys it is primary of, and forwards other
/// writes to the key's primary once the whole group is observed live.
pub struct KvServer {
    /// My server index.
    me: ServerIdx,

    /// Key -> replica group mapping shared with every clerk.
    router: ShardRouter,

    /// External membership oracle.
    liveness: Arc<dyn Liveness>,

    /// Transport used to reach peer servers for forwarding and pushes.
    peers: Arc<dyn Transport>,

    /// Store and dedup table behind one mutual-exclusion region. Never held
    /// across a call to a peer.
    state: Mutex<ServerState>,
}

impl fmt::Debug for KvServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KvServer")
            .field("me", &self.me)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

// KvServer public API implementation
impl KvServer {
    /// Creates a new server with empty state.
    pub fn new(
        me: ServerIdx,
        router: ShardRouter,
        liveness: Arc<dyn Liveness>,
        peers: Arc<dyn Transport>,
    ) -> Result<Self, ShardKvError> {
        if me >= router.nservers() {
            return logged_err!(
                me;
                "invalid server index {} with nservers {}",
                me,
                router.nservers()
            );
        }

        Ok(KvServer {
            me,
            router,
            liveness,
            peers,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Gets my server index.
    #[inline]
    pub fn id(&self) -> ServerIdx {
        self.me
    }

    /// Dispatches one request to its handler. `Err` means a transport
    /// failure happened while forwarding on the caller's behalf.
    pub async fn handle_req(
        &self,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        match req {
            ApiRequest::Get { key } => Ok(self.handle_get(&key).await),
            ApiRequest::PutAppend(args) => self.handle_put_append(args).await,
            ApiRequest::Replicate {
                key,
                value,
                version,
            } => {
                self.apply_replica(key, value, version).await;
                Ok(ApiReply::Replicated)
            }
        }
    }

    /// Handles a Get. Any member of the key's replica group answers from its
    /// local state; no liveness check, no forwarding.
    pub async fn handle_get(&self, key: &str) -> ApiReply {
        if !self.router.in_group(key, self.me) {
            pf_trace!(self.me; "get '{}' wrong shard", key);
            return ApiReply::WrongShard;
        }

        let state = self.state.lock().await;
        let value = state.store.get(key).cloned().unwrap_or_default();
        ApiReply::Get { value }
    }

    /// Handles a Put or Append. Applied here if I am the key's primary,
    /// otherwise forwarded to the primary after checking group liveness.
    pub async fn handle_put_append(
        &self,
        args: PutAppendArgs,
    ) -> Result<ApiReply, ShardKvError> {
        if !self.liveness.is_up(self.me) {
            pf_debug!(self.me; "refusing {:?}: i am down", args.op);
            return Ok(ApiReply::Refused {
                reason: RefuseReason::NodeDown,
            });
        }

        let group = self.router.replica_group(&args.key);
        if group[0] == self.me {
            Ok(self.apply_as_primary(args, &group).await)
        } else {
            self.forward_to_primary(args, &group).await
        }
    }

    /// Installs a value pushed by the key's primary, unless a newer version
    /// of the key is already installed.
    pub async fn apply_replica(
        &self,
        key: String,
        value: String,
        version: Version,
    ) {
        let mut state = self.state.lock().await;
        if state.store.install(key.clone(), value, version) {
            pf_trace!(self.me; "replica push '{}' v{} installed", key, version);
        } else {
            pf_debug!(
                self.me;
                "replica push '{}' v{} stale, ignored",
                key,
                version
            );
        }
    }

    /// Reads my local copy of key regardless of shard ownership.
    pub async fn local_value(&self, key: &str) -> Option<String> {
        self.state.lock().await.store.get(key).cloned()
    }
}

// KvServer write path implementation
impl KvServer {
    /// Returns the first replica (non-primary member) of group that the
    /// oracle reports down, if any.
    fn first_down_replica(&self, group: &[ServerIdx]) -> Option<ServerIdx> {
        group[1..]
            .iter()
            .copied()
            .find(|&s| !self.liveness.is_up(s))
    }

    /// Primary path: dedup check, group liveness check and mutation happen
    /// atomically under my lock; the new value is then pushed to replicas
    /// with the lock released.
    async fn apply_as_primary(
        &self,
        args: PutAppendArgs,
        group: &[ServerIdx],
    ) -> ApiReply {
        let (old_value, new_value, version) = {
            let mut state = self.state.lock().await;

            if let Some(reply) = state.dedup.lookup(args.client, args.seq) {
                pf_debug!(
                    self.me;
                    "duplicate write {}#{} on '{}'",
                    args.client,
                    args.seq,
                    args.key
                );
                return ApiReply::PutAppend {
                    old_value: reply.to_string(),
                };
            }

            if let Some(down) = self.first_down_replica(group) {
                pf_debug!(
                    self.me;
                    "refusing write on '{}': replica {} down",
                    args.key,
                    down
                );
                return ApiReply::Refused {
                    reason: RefuseReason::NodeDown,
                };
            }

            let old_value = state
                .store
                .execute(&args.to_command())
                .into_value()
                .unwrap_or_default();
            state.dedup.record(args.client, args.seq, old_value.clone());
            let (new_value, version) = state
                .store
                .get_versioned(&args.key)
                .map(|(value, version)| (value.clone(), version))
                .unwrap_or_default();
            (old_value, new_value, version)
        };

        pf_trace!(
            self.me;
            "applied {:?} {}#{} on '{}'",
            args.op,
            args.client,
            args.seq,
            args.key
        );
        self.push_to_replicas(&args.key, &new_value, version, &group[1..])
            .await;

        ApiReply::PutAppend { old_value }
    }

    /// Pushes a key's committed value to all given replicas concurrently.
    /// Failures are logged; the write stays committed at the primary.
    async fn push_to_replicas(
        &self,
        key: &str,
        value: &str,
        version: Version,
        replicas: &[ServerIdx],
    ) {
        let pushes = replicas.iter().map(|&replica| {
            let req = ApiRequest::Replicate {
                key: key.into(),
                value: value.into(),
                version,
            };
            async move { (replica, self.peers.call(replica, req).await) }
        });

        for (replica, result) in join_all(pushes).await {
            match result {
                Ok(ApiReply::Replicated) => {}
                Ok(reply) => {
                    pf_warn!(
                        self.me;
                        "unexpected push reply from {}: {:?}",
                        replica,
                        reply
                    );
                }
                Err(e) => {
                    pf_warn!(
                        self.me;
                        "push of '{}' to {} failed: {}",
                        key,
                        replica,
                        e
                    );
                }
            }
        }
    }

    /// Non-primary path: refuse unless every replica and the primary are
    /// live, then forward verbatim and relay the primary's reply.
    async fn forward_to_primary(
        &self,
        args: PutAppendArgs,
        group: &[ServerIdx],
    ) -> Result<ApiReply, ShardKvError> {
        if let Some(down) = self.first_down_replica(group) {
            pf_debug!(
                self.me;
                "refusing write on '{}': replica {} down",
                args.key,
                down
            );
            return Ok(ApiReply::Refused {
                reason: RefuseReason::NodeDown,
            });
        }

        let primary = group[0];
        if !self.liveness.is_up(primary) {
            pf_debug!(
                self.me;
                "refusing write on '{}': primary {} down",
                args.key,
                primary
            );
            return Ok(ApiReply::Refused {
                reason: RefuseReason::PrimaryDown,
            });
        }

        pf_trace!(self.me; "forwarding write on '{}' to {}", args.key, primary);
        self.peers
            .call(primary, ApiRequest::PutAppend(args))
            .await
    }
}

#[cfg(test)]
mod kvserver_tests {
    use super::*;
    use crate::cluster::{ClusterConfig, LivenessMap, LocalCluster, LocalNetwork};
    use crate::server::WriteOp;
    use tokio::time::{self, Duration};

    fn write(
        op: WriteOp,
        key: &str,
        value: &str,
        client: u64,
        seq: u64,
    ) -> PutAppendArgs {
        PutAppendArgs {
            op,
            key: key.into(),
            value: value.into(),
            client,
            seq,
        }
    }

    fn applied(old_value: &str) -> ApiReply {
        ApiReply::PutAppend {
            old_value: old_value.into(),
        }
    }

    fn refused(reason: RefuseReason) -> ApiReply {
        ApiReply::Refused { reason }
    }

    async fn values_of(cluster: &LocalCluster, key: &str) -> Vec<Option<String>> {
        let mut values = vec![];
        for server in cluster.servers() {
            values.push(server.local_value(key).await);
        }
        values
    }

    #[test]
    fn new_invalid_index() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        assert!(KvServer::new(
            3,
            cluster.router(),
            cluster.liveness().clone(),
            cluster.network()
        )
        .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_wrong_shard() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s0 = cluster.server(0).unwrap();
        assert_eq!(s0.handle_get("4").await, ApiReply::WrongShard);
        assert_eq!(s0.local_value("4").await, None);
        assert_eq!(
            cluster.server(2).unwrap().handle_get("4").await,
            ApiReply::Get {
                value: String::new()
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn primary_applies_and_pushes() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s1 = cluster.server(1).unwrap();
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Append, "4", "a", 7, 1))
                .await?,
            applied("")
        );
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Append, "4", "b", 7, 2))
                .await?,
            applied("a")
        );
        assert_eq!(
            values_of(&cluster, "4").await,
            vec![None, Some("ab".into()), Some("ab".into())]
        );
        for idx in [1, 2] {
            assert_eq!(
                cluster.server(idx).unwrap().handle_get("4").await,
                ApiReply::Get { value: "ab".into() }
            );
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_applied_once() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s1 = cluster.server(1).unwrap();
        let args = write(WriteOp::Append, "4", "x", 7, 1);
        assert_eq!(s1.handle_put_append(args.clone()).await?, applied(""));
        assert_eq!(s1.handle_put_append(args.clone()).await?, applied(""));

        // a retry via a non-primary member is still recognized
        let s2 = cluster.server(2).unwrap();
        assert_eq!(s2.handle_put_append(args).await?, applied(""));
        assert_eq!(s1.local_value("4").await, Some("x".into()));
        assert_eq!(s2.local_value("4").await, Some("x".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_seq_not_reapplied() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s1 = cluster.server(1).unwrap();
        for (seq, value) in [(1, "a"), (2, "b"), (3, "c")] {
            s1.handle_put_append(write(WriteOp::Append, "4", value, 7, seq))
                .await?;
        }
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Append, "4", "a", 7, 1))
                .await?,
            applied("ab")
        );
        assert_eq!(s1.local_value("4").await, Some("abc".into()));

        // another client's sequence numbers are independent
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Put, "4", "z", 8, 1))
                .await?,
            applied("abc")
        );
        assert_eq!(s1.local_value("4").await, Some("z".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forward_from_outside_group() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s0 = cluster.server(0).unwrap();
        assert_eq!(
            s0.handle_put_append(write(WriteOp::Put, "4", "x", 7, 1))
                .await?,
            applied("")
        );
        assert_eq!(
            values_of(&cluster, "4").await,
            vec![None, Some("x".into()), Some("x".into())]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replica_down_refused() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        cluster.set_up(2, false)?;
        let args = write(WriteOp::Put, "4", "x", 7, 1);
        for idx in [0, 1] {
            assert_eq!(
                cluster
                    .server(idx)
                    .unwrap()
                    .handle_put_append(args.clone())
                    .await?,
                refused(RefuseReason::NodeDown)
            );
        }
        assert_eq!(values_of(&cluster, "4").await, vec![None, None, None]);

        // the refused write left no dedup trace
        cluster.set_up(2, true)?;
        assert_eq!(
            cluster.server(1).unwrap().handle_put_append(args).await?,
            applied("")
        );
        assert_eq!(
            cluster.server(2).unwrap().local_value("4").await,
            Some("x".into())
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn primary_down_refused() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        cluster.set_up(1, false)?;
        let args = write(WriteOp::Put, "4", "x", 7, 1);
        for idx in [0, 2] {
            assert_eq!(
                cluster
                    .server(idx)
                    .unwrap()
                    .handle_put_append(args.clone())
                    .await?,
                refused(RefuseReason::PrimaryDown)
            );
        }
        assert_eq!(values_of(&cluster, "4").await, vec![None, None, None]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn self_down_refused() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s1 = cluster.server(1).unwrap();
        s1.handle_put_append(write(WriteOp::Put, "4", "x", 7, 1))
            .await?;

        cluster.set_up(1, false)?;
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Put, "4", "y", 7, 2))
                .await?,
            refused(RefuseReason::NodeDown)
        );
        assert_eq!(
            values_of(&cluster, "4").await,
            vec![None, Some("x".into()), Some("x".into())]
        );

        // reads are served regardless of liveness
        assert_eq!(
            s1.handle_get("4").await,
            ApiReply::Get { value: "x".into() }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_answered_with_replica_down() -> Result<(), ShardKvError>
    {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s1 = cluster.server(1).unwrap();
        let args = write(WriteOp::Append, "4", "x", 7, 1);
        s1.handle_put_append(args.clone()).await?;

        cluster.set_up(2, false)?;
        assert_eq!(s1.handle_put_append(args).await?, applied(""));
        assert_eq!(
            s1.handle_put_append(write(WriteOp::Append, "4", "y", 7, 2))
                .await?,
            refused(RefuseReason::NodeDown)
        );
        assert_eq!(s1.local_value("4").await, Some("x".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_replica_groups() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig {
            nservers: 3,
            nreplicas: 1,
        })?;
        let s0 = cluster.server(0).unwrap();
        assert_eq!(
            s0.handle_put_append(write(WriteOp::Put, "4", "x", 7, 1))
                .await?,
            applied("")
        );
        assert_eq!(
            values_of(&cluster, "4").await,
            vec![None, Some("x".into()), None]
        );
        assert_eq!(
            cluster.server(2).unwrap().handle_get("4").await,
            ApiReply::WrongShard
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replicate_newer_only() -> Result<(), ShardKvError> {
        let cluster = LocalCluster::new(ClusterConfig::default())?;
        let s0 = cluster.server(0).unwrap();
        for (value, version) in [("v2", 2), ("v1", 1), ("v3", 3)] {
            assert_eq!(
                s0.handle_req(ApiRequest::Replicate {
                    key: "4".into(),
                    value: value.into(),
                    version,
                })
                .await?,
                ApiReply::Replicated
            );
            if version == 1 {
                assert_eq!(s0.local_value("4").await, Some("v2".into()));
            }
        }
        assert_eq!(s0.local_value("4").await, Some("v3".into()));
        Ok(())
    }

    /// Holds back replica pushes carrying `slow_value` before delivering.
    struct SlowPushes {
        inner: Arc<LocalNetwork>,
        slow_value: &'static str,
    }

    #[async_trait::async_trait]
    impl Transport for SlowPushes {
        async fn call(
            &self,
            server: ServerIdx,
            req: ApiRequest,
        ) -> Result<ApiReply, ShardKvError> {
            let slow = matches!(
                &req,
                ApiRequest::Replicate { value, .. } if value == self.slow_value
            );
            if slow {
                time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.call(server, req).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reordered_pushes_converge() -> Result<(), ShardKvError> {
        let router = ShardRouter::new(&ClusterConfig::default())?;
        let liveness = Arc::new(LivenessMap::new(3)?);
        let network = Arc::new(LocalNetwork::new(liveness.clone()));
        let peers = Arc::new(SlowPushes {
            inner: network.clone(),
            slow_value: "a",
        });
        let servers = (0..3)
            .map(|me| {
                KvServer::new(me, router, liveness.clone(), peers.clone())
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        network.attach(&servers)?;

        let first = {
            let primary = servers[1].clone();
            tokio::spawn(async move {
                primary
                    .handle_put_append(write(WriteOp::Put, "4", "a", 7, 1))
                    .await
            })
        };
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            servers[1]
                .handle_put_append(write(WriteOp::Put, "4", "b", 8, 1))
                .await?,
            applied("a")
        );
        assert_eq!(first.await??, applied(""));

        assert_eq!(servers[1].local_value("4").await, Some("b".into()));
        assert_eq!(servers[2].local_value("4").await, Some("b".into()));
        assert_eq!(
            servers[2].handle_get("4").await,
            ApiReply::Get { value: "b".into() }
        );
        Ok(())
    }
}
