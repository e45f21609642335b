//! Broker hand-off channel.
//!
//! The broker accepts driver connections and passes each accepted fd to the
//! proxy over a Unix-domain socket via SCM_RIGHTS. The proxy identifies
//! itself with a 4-byte network-order proxy id and acknowledges every
//! hand-off with a 4-byte status.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, info};
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

use crate::IoSetupError;

pub const HANDOFF_OK: i32 = 0;
pub const HANDOFF_REFUSED: i32 = -1;

pub struct BrokerChannel {
    stream: UnixStream,
}

impl BrokerChannel {
    /// Connects to the broker and registers this proxy by id.
    pub fn connect(path: &Path, proxy_id: u32) -> Result<Self, IoSetupError> {
        let mut stream = UnixStream::connect(path).map_err(IoSetupError::Broker)?;
        stream
            .write_all(&proxy_id.to_be_bytes())
            .map_err(IoSetupError::Broker)?;
        stream.set_nonblocking(true).map_err(IoSetupError::Broker)?;
        info!("registered to broker at {} as proxy {}", path.display(), proxy_id);
        Ok(Self { stream })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Receives one client fd passed by the broker. `Ok(None)` when no
    /// hand-off is pending; `Err` when the broker connection is gone.
    pub fn recv_client_fd(&mut self) -> Result<Option<RawFd>, IoSetupError> {
        let mut data = [0u8; 4];
        let mut iov = [std::io::IoSliceMut::new(&mut data)];
        let mut cmsg = cmsg_space!([RawFd; 1]);

        let received = match recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(IoSetupError::Broker(e.into())),
        };

        if received.bytes == 0 {
            return Err(IoSetupError::Broker(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed the hand-off channel",
            )));
        }

        for cmsg in received.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    debug!("received client fd {} from broker", fd);
                    return Ok(Some(fd));
                }
            }
        }
        Ok(None)
    }

    /// Acknowledges a hand-off. The broker aborts the accept when the status
    /// is not [`HANDOFF_OK`].
    pub fn send_status(&mut self, status: i32) -> Result<(), IoSetupError> {
        self.stream
            .write_all(&status.to_be_bytes())
            .map_err(IoSetupError::Broker)
    }
}

/// Broker-side helper: passes an accepted fd and reads the 4-byte ack.
/// Lives here so tests and the broker process share one implementation.
pub fn pass_fd_and_wait_ack(channel: &mut UnixStream, fd: RawFd) -> Result<i32, IoSetupError> {
    use nix::sys::socket::{sendmsg, ControlMessage};

    let data = [0u8; 4];
    let iov = [std::io::IoSlice::new(&data)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(channel.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| IoSetupError::Broker(e.into()))?;

    let mut ack = [0u8; 4];
    channel.read_exact(&mut ack).map_err(IoSetupError::Broker)?;
    Ok(i32::from_be_bytes(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn fd_passing_round_trip() {
        let dir = std::env::temp_dir().join(format!("shardcast-broker-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broker.sock");

        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let mut proxy_side = BrokerChannel::connect(&path, 7).unwrap();
        let (mut broker_side, _) = listener.accept().unwrap();

        // Broker reads the proxy id first.
        let mut id = [0u8; 4];
        broker_side.read_exact(&mut id).unwrap();
        assert_eq!(u32::from_be_bytes(id), 7);

        // Hand a socketpair end across and ack it.
        let (payload, keep) = UnixStream::pair().unwrap();
        let broker = std::thread::spawn(move || {
            pass_fd_and_wait_ack(&mut broker_side, payload.as_raw_fd()).unwrap()
        });

        let fd = loop {
            if let Some(fd) = proxy_side.recv_client_fd().unwrap() {
                break fd;
            }
        };
        proxy_side.send_status(HANDOFF_OK).unwrap();
        assert_eq!(broker.join().unwrap(), HANDOFF_OK);

        // The received fd is a live duplicate of the passed socket.
        let mut received = unsafe { UnixStream::from_raw_fd(fd) };
        let mut keep = keep;
        keep.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
