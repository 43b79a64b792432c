//! Cluster membership liveness oracle.

use std::sync::RwLock;

use crate::cluster::ServerIdx;
use crate::utils::{Bitmap, ShardKvError};

/// Point-in-time view of which servers are currently up. Consulted
/// synchronously by servers before accepting or forwarding writes; answers
/// may change between consecutive calls.
pub trait Liveness: Send + Sync {
    /// Returns whether the given server is currently up. Unknown indices are
    /// reported as down.
    fn is_up(&self, server: ServerIdx) -> bool;
}

/// In-memory liveness oracle backed by a bitmap. All servers start up.
#[derive(Debug)]
pub struct LivenessMap {
    up: RwLock<Bitmap>,
}

impl LivenessMap {
    /// Creates a new oracle over `nservers` servers, all initially up.
    pub fn new(nservers: u8) -> Result<Self, ShardKvError> {
        if nservers == 0 {
            return Err(ShardKvError::msg("invalid nservers 0"));
        }
        Ok(LivenessMap {
            up: RwLock::new(Bitmap::new(nservers, true)),
        })
    }

    /// Marks a server up or down.
    pub fn set_up(
        &self,
        server: ServerIdx,
        up: bool,
    ) -> Result<(), ShardKvError> {
        let mut guard = self.up.write().unwrap_or_else(|e| e.into_inner());
        guard.set(server, up)
    }

}

impl Liveness for LivenessMap {
    fn is_up(&self, server: ServerIdx) -> bool {
        self.up
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server)
            .unwrap_or(false)
    }
}
