//! ShardKV's cluster-wide building blocks: shard routing, liveness oracle,
//! and transports.

mod liveness;
mod local;
mod router;
mod transport;

pub use liveness::{Liveness, LivenessMap};
pub use local::{LocalCluster, LocalNetwork};
pub use router::{ClusterConfig, ShardRouter};
pub use transport::Transport;

/// Server index type.
pub type ServerIdx = u8;
