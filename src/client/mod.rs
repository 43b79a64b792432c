//! ShardKV client-side modules.

mod apistub;
mod clerk;

pub use apistub::{TcpTransport, TcpTransportConfig};
pub use clerk::{Clerk, ClerkConfig};

/// Client ID type.
pub type ClientId = u64;
