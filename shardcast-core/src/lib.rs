//! The shardcast engine: a single-threaded reactor that multiplexes many
//! driver connections onto bounded per-shard pools of CAS workers.
//!
//! All mutation happens on the reactor thread. State lives in one
//! [`reactor::ProxyRuntime`] value; components reference each other through
//! `(index, generation)` handles, never pointers, so recycled slots are
//! detected instead of aliased.

pub mod cas_io;
pub mod client_io;
pub mod config;
pub mod context;
pub mod event;
pub mod handler;
pub mod parser;
pub mod queue;
pub mod reactor;
pub mod router;
pub mod socket_io;
pub mod stats;
pub mod stmt;
pub mod timer;

use thiserror::Error;

/// Invalid slot id shared by the shard, CAS, client and context pools.
pub const INVALID_ID: i32 = -1;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] shardcast_io::IoSetupError),
    #[error(transparent)]
    Proto(#[from] shardcast_proto::ProtoError),
    #[error("{0} pool exhausted")]
    Exhausted(&'static str),
}

/// Wall-clock seconds. Waiter deadlines are second-granular; the ~1 Hz timer
/// sweep compares against this.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
