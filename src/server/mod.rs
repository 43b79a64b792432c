//! ShardKV's server functionality modules.

mod dedup;
mod external;
mod kvserver;
mod statemach;

pub use dedup::DedupTable;
pub use external::{
    ApiReply, ApiRequest, ExternalApi, PutAppendArgs, RefuseReason, SeqId,
    WriteOp,
};
pub use kvserver::KvServer;
pub use statemach::{Command, CommandResult, KvStore, Version};
