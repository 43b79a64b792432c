//! ShardKV core library: a sharded key-value store where each key lives on a
//! small replica group whose primary pushes every committed value to the
//! rest of the group.

#[macro_use]
mod utils;

mod client;
mod cluster;
mod server;

// Helper utilities, functions, and macros
pub use utils::{logger_init, Bitmap, ShardKvError};

// Cluster-wide building blocks
pub use cluster::{
    ClusterConfig, Liveness, LivenessMap, LocalCluster, LocalNetwork,
    ServerIdx, ShardRouter, Transport,
};

// Server-side public types
pub use server::{
    ApiReply, ApiRequest, Command, CommandResult, DedupTable, ExternalApi,
    KvServer, KvStore, PutAppendArgs, RefuseReason, SeqId, Version, WriteOp,
};

// Client-side public types
pub use client::{
    Clerk, ClerkConfig, ClientId, TcpTransport, TcpTransportConfig,
};
