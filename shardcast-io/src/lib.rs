//! OS-facing I/O layer for the shardcast proxy.
//!
//! Everything the engine needs from the kernel lives here: the epoll poller,
//! nonblocking listener construction, the broker fd hand-off channel, and a
//! few process-level knobs (SIGPIPE, thread pinning).

pub mod broker;
pub mod net;
pub mod platform;
pub mod poller;

use thiserror::Error;

pub use broker::BrokerChannel;
pub use poller::{Interest, Poller, Readiness};

#[derive(Error, Debug)]
pub enum IoSetupError {
    #[error("epoll operation failed: {0}")]
    Epoll(#[source] nix::errno::Errno),
    #[error("socket setup failed: {0}")]
    Socket(#[source] std::io::Error),
    #[error("broker handshake failed: {0}")]
    Broker(#[source] std::io::Error),
}
