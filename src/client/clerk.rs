//! ShardKV clerk: client-side routing and retry logic.

use std::fmt;
use std::sync::Arc;

use crate::client::ClientId;
use crate::cluster::{ServerIdx, ShardRouter, Transport};
use crate::server::{ApiReply, ApiRequest, PutAppendArgs, SeqId, WriteOp};
use crate::utils::ShardKvError;

use rand::Rng;

use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClerkConfig {
    /// Pause after the first fruitless pass over a replica group.
    pub backoff_min_ms: u64,

    /// Cap on the pause between passes; the pause doubles up to this.
    pub backoff_max_ms: u64,
}

impl Default for ClerkConfig {
    fn default() -> Self {
        ClerkConfig {
            backoff_min_ms: 10,
            backoff_max_ms: 500,
        }
    }
}

/// Client library for issuing Get/Put/Append against the cluster. Not
/// thread-safe; each concurrent caller should own its own clerk so that
/// write sequence numbers stay strictly increasing.
pub struct Clerk {
    /// Random client ID, fixed for the lifetime of the clerk.
    id: ClientId,

    /// Sequence number of the last logical write issued.
    seq: SeqId,

    /// Key -> replica group mapping, identical to the servers'.
    router: ShardRouter,

    /// Transport to reach servers.
    transport: Arc<dyn Transport>,

    /// Configuration parameters struct.
    config: ClerkConfig,
}

impl fmt::Debug for Clerk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clerk")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Clerk {
    /// Creates a new clerk with a fresh random client ID.
    pub fn new(
        router: ShardRouter,
        transport: Arc<dyn Transport>,
        config_str: Option<&str>,
    ) -> Result<Self, ShardKvError> {
        let config = parsed_config!(config_str => ClerkConfig;
                                    backoff_min_ms, backoff_max_ms)?;
        if config.backoff_min_ms == 0 {
            return Err(ShardKvError(format!(
                "invalid config.backoff_min_ms {}",
                config.backoff_min_ms
            )));
        }
        if config.backoff_max_ms < config.backoff_min_ms {
            return Err(ShardKvError(format!(
                "invalid config.backoff_max_ms {} < backoff_min_ms {}",
                config.backoff_max_ms, config.backoff_min_ms
            )));
        }

        let id: ClientId = rand::thread_rng().gen();
        pf_debug!(id; "clerk created with {:?}", config);

        Ok(Clerk {
            id,
            seq: 0,
            router,
            transport,
            config,
        })
    }

    /// Gets my client ID.
    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Fetches the current value for a key, `""` if it does not exist.
    /// Keeps retrying the key's replica group in the face of transport
    /// failures; returns `Err` only if every member of the group replies
    /// wrong-shard within one pass.
    pub async fn get(&self, key: &str) -> Result<String, ShardKvError> {
        let group = self.router.replica_group(key);
        let mut backoff = self.initial_backoff();

        loop {
            let mut wrong_shard = 0;
            for &server in &group {
                let req = ApiRequest::Get { key: key.into() };
                match self.transport.call(server, req).await {
                    Ok(ApiReply::Get { value }) => return Ok(value),
                    Ok(ApiReply::WrongShard) => {
                        pf_trace!(self.id; "get '{}': {} wrong shard", key, server);
                        wrong_shard += 1;
                    }
                    Ok(reply) => {
                        pf_debug!(
                            self.id;
                            "get '{}': {} replied {:?}",
                            key,
                            server,
                            reply
                        );
                    }
                    Err(e) => {
                        pf_debug!(self.id; "get '{}': {} failed: {}", key, server, e);
                    }
                }
            }

            if wrong_shard == group.len() {
                pf_warn!(
                    self.id;
                    "get '{}': whole group {:?} replied wrong shard",
                    key,
                    group
                );
                return Err(ShardKvError(format!(
                    "wrong shard: no server of group {:?} serves key '{}'",
                    group, key
                )));
            }

            self.pause(&mut backoff).await;
        }
    }

    /// Replaces the value of key. Returns the value held before the write.
    pub async fn put(&mut self, key: &str, value: &str) -> String {
        self.put_append(WriteOp::Put, key, value).await
    }

    /// Appends to the value of key. Returns the value held before the write.
    pub async fn append(&mut self, key: &str, value: &str) -> String {
        self.put_append(WriteOp::Append, key, value).await
    }

    /// Shared by Put and Append. Takes one sequence number per logical call
    /// and retries with it against the key's replica group until some
    /// server reports the write applied.
    async fn put_append(
        &mut self,
        op: WriteOp,
        key: &str,
        value: &str,
    ) -> String {
        self.seq += 1;
        let args = PutAppendArgs {
            op,
            key: key.into(),
            value: value.into(),
            client: self.id,
            seq: self.seq,
        };

        let group = self.router.replica_group(key);
        let mut backoff = self.initial_backoff();

        loop {
            for &server in &group {
                let req = ApiRequest::PutAppend(args.clone());
                match self.transport.call(server, req).await {
                    Ok(ApiReply::PutAppend { old_value }) => return old_value,
                    Ok(reply) => self.log_write_miss(&args, server, &reply),
                    Err(e) => {
                        pf_debug!(
                            self.id;
                            "{:?} #{} '{}': {} failed: {}",
                            op,
                            args.seq,
                            key,
                            server,
                            e
                        );
                    }
                }
            }

            self.pause(&mut backoff).await;
        }
    }

    fn log_write_miss(
        &self,
        args: &PutAppendArgs,
        server: ServerIdx,
        reply: &ApiReply,
    ) {
        pf_debug!(
            self.id;
            "{:?} #{} '{}': {} replied {:?}",
            args.op,
            args.seq,
            args.key,
            server,
            reply
        );
    }

    #[inline]
    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.config.backoff_min_ms)
    }

    /// Sleeps for the current backoff, then doubles it up to the cap.
    async fn pause(&self, backoff: &mut Duration) {
        time::sleep(*backoff).await;
        *backoff = (*backoff * 2)
            .min(Duration::from_millis(self.config.backoff_max_ms));
    }
}
