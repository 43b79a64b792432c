//! Transport abstraction over which clerks and servers exchange requests.

use crate::cluster::ServerIdx;
use crate::server::{ApiReply, ApiRequest};
use crate::utils::ShardKvError;

use async_trait::async_trait;

/// Dispatches a request to a named server and returns its reply. `Err` means
/// the call did not complete: the server was unreachable, the connection
/// broke, or the call timed out. Callers must treat such outcomes as
/// inconclusive.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        server: ServerIdx,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardKvError>;
}
