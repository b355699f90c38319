//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::Bitmap;
pub use error::FleaseError;
pub use print::{logger_init, ME};

pub(crate) use safetcp::{tcp_bind_with_retry, tcp_connect_with_retry};
pub(crate) use safetcp::{safe_tcp_read, safe_tcp_write, MAX_FRAME_LEN};
