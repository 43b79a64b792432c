//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::Bitmap;
pub use error::ShardKvError;
pub use print::logger_init;

pub(crate) use safetcp::{
    tcp_bind_with_retry, tcp_connect_with_retry, tcp_recv_obj, tcp_send_obj,
};
