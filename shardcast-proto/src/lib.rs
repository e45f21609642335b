//! Driver wire protocol for the shardcast proxy.
//!
//! The proxy treats driver traffic as opaque framed messages plus a handful
//! of scanned fields: the 8-byte header, the function code, the result code
//! of a reply and the length-prefixed argument list of a request. Everything
//! here is the byte-level vocabulary shared by the engine and the server.

pub mod error;
pub mod frame;
pub mod func;
pub mod reply;
pub mod version;

use thiserror::Error;

pub use error::*;
pub use frame::*;
pub use func::{FuncCode, FN_MAX};
pub use version::BrokerVersion;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid body length {0}")]
    BadLength(i32),
    #[error("malformed argument list at offset {0}")]
    BadArgv(usize),
    #[error("unsupported function code {0}")]
    BadFuncCode(u8),
}
