//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod backoff;
mod error;
mod safetcp;

pub use backoff::Backoff;
pub use error::CausalKvError;
pub use print::logger_init;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_request,
};
