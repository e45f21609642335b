//! Per-fd socket state and the framing state machines.
//!
//! Reads assemble one message at a time: an 8-byte header, then the body the
//! header declares. Writes drain the single pending write event; EAGAIN
//! leaves it in place and the reactor keeps write readiness armed until it
//! completes. Sockets in `CloseWait` stay in the table until their owner is
//! freed so late handlers still resolve the fd.

use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};

use log::debug;
use nix::errno::Errno;

use shardcast_proto::frame::{self, MSG_HEADER_SIZE};

use crate::event::{EventKind, IoBuffer, ProxyEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockStatus {
    /// Accepted, first (registration) message not yet processed.
    RegWait,
    Established,
    CloseWait,
}

/// What the fd is bound to once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockAddr {
    Unbound,
    Client { client_id: i32 },
    Cas { shard_id: i32, cas_id: i32 },
}

#[derive(Debug)]
pub struct SocketIo {
    pub fd: RawFd,
    pub status: SockStatus,
    pub from_cas: bool,
    pub addr: SockAddr,
    pub read_event: Option<ProxyEvent>,
    pub write_event: Option<ProxyEvent>,
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// One complete message, retagged for dispatch.
    Message(ProxyEvent),
    /// Nothing more to read for now.
    Pending,
    /// Orderly EOF from the peer.
    Closed,
    Error(Errno),
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Done,
    Pending,
    Error(Errno),
}

impl SocketIo {
    fn new(fd: RawFd, from_cas: bool) -> Self {
        Self {
            fd,
            status: SockStatus::RegWait,
            from_cas,
            addr: SockAddr::Unbound,
            read_event: None,
            write_event: None,
        }
    }

    /// Drives the read state machine until one message completes or the
    /// kernel runs dry.
    pub fn read_step(&mut self) -> ReadOutcome {
        loop {
            let event = self.read_event.get_or_insert_with(|| {
                let mut e = ProxyEvent::new(EventKind::IoRead, self.from_cas);
                e.buffer = IoBuffer::with_len(MSG_HEADER_SIZE);
                e
            });

            let buf = &mut event.buffer;
            match nix::unistd::read(self.fd, &mut buf.data[buf.offset..]) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    buf.offset += n;
                    if !buf.is_complete() {
                        continue;
                    }
                    if buf.data.len() == MSG_HEADER_SIZE {
                        let body_len = match frame::decode_body_length(&buf.data) {
                            Ok(len) => len,
                            Err(_) => return ReadOutcome::Error(Errno::EPROTO),
                        };
                        if body_len > 0 {
                            buf.grow_to(MSG_HEADER_SIZE + body_len);
                            continue;
                        }
                    }
                    let mut event = self.read_event.take().unwrap();
                    event.kind = if self.from_cas {
                        EventKind::CasResponse
                    } else {
                        EventKind::ClientRequest
                    };
                    return ReadOutcome::Message(event);
                }
                Err(Errno::EAGAIN) => return ReadOutcome::Pending,
                Err(Errno::EINTR) => continue,
                Err(e) => return ReadOutcome::Error(e),
            }
        }
    }

    /// Drives the pending write event. [`WriteOutcome::Done`] means the slot
    /// is empty again and write readiness can be dropped.
    pub fn write_step(&mut self) -> WriteOutcome {
        let Some(event) = self.write_event.as_mut() else {
            return WriteOutcome::Done;
        };
        // SAFETY: the fd is owned by the socket table entry and stays open
        // at least until the entry is removed.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        loop {
            let buf = &mut event.buffer;
            match nix::unistd::write(fd, &buf.data[buf.offset..]) {
                Ok(n) => {
                    buf.offset += n;
                    if buf.is_complete() {
                        self.write_event = None;
                        return WriteOutcome::Done;
                    }
                }
                Err(Errno::EAGAIN) => return WriteOutcome::Pending,
                Err(Errno::EINTR) => continue,
                Err(e) => return WriteOutcome::Error(e),
            }
        }
    }
}

/// fd -> socket state. A hash map rather than an fd-indexed array: lookup
/// stays O(1) and a reused fd number cannot alias a stale entry because the
/// old entry is removed before its fd is closed.
pub struct SocketTable {
    map: HashMap<RawFd, SocketIo>,
    max_socket: usize,
}

impl SocketTable {
    pub fn new(max_socket: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_socket,
        }
    }

    pub fn add(&mut self, fd: RawFd, from_cas: bool) -> Result<&mut SocketIo, ()> {
        if self.map.len() >= self.max_socket {
            return Err(());
        }
        debug!("socket added. (fd:{}, from_cas:{})", fd, from_cas);
        Ok(self.map.entry(fd).or_insert_with(|| SocketIo::new(fd, from_cas)))
    }

    pub fn get(&self, fd: RawFd) -> Option<&SocketIo> {
        self.map.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut SocketIo> {
        self.map.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<SocketIo> {
        self.map.remove(&fd)
    }

    pub fn find_fd_by_client(&self, client_id: i32) -> Option<RawFd> {
        self.map
            .values()
            .find(|s| s.addr == SockAddr::Client { client_id })
            .map(|s| s.fd)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.map.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcast_proto::frame::build_request;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn reads_one_complete_message() {
        let (mut peer, sock) = pair();
        let mut sio = SocketIo::new(sock.as_raw_fd(), false);

        let msg = build_request(2, &[b"SELECT 1\0"]);
        peer.write_all(&msg).unwrap();

        match sio.read_step() {
            ReadOutcome::Message(event) => {
                assert_eq!(event.kind, EventKind::ClientRequest);
                assert_eq!(event.msg(), &msg[..]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(sio.read_step(), ReadOutcome::Pending));
    }

    #[test]
    fn reassembles_partial_frames() {
        let (mut peer, sock) = pair();
        let mut sio = SocketIo::new(sock.as_raw_fd(), true);

        let msg = build_request(1, &[&[1u8]]);
        peer.write_all(&msg[..3]).unwrap();
        assert!(matches!(sio.read_step(), ReadOutcome::Pending));
        peer.write_all(&msg[3..10]).unwrap();
        assert!(matches!(sio.read_step(), ReadOutcome::Pending));
        peer.write_all(&msg[10..]).unwrap();
        match sio.read_step() {
            ReadOutcome::Message(event) => {
                assert_eq!(event.kind, EventKind::CasResponse);
                assert_eq!(event.msg(), &msg[..]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn eof_reports_closed() {
        let (peer, sock) = pair();
        let mut sio = SocketIo::new(sock.as_raw_fd(), false);
        drop(peer);
        assert!(matches!(sio.read_step(), ReadOutcome::Closed));
    }

    #[test]
    fn oversized_header_is_a_protocol_error() {
        let (mut peer, sock) = pair();
        let mut sio = SocketIo::new(sock.as_raw_fd(), false);
        let mut bad = [0u8; MSG_HEADER_SIZE];
        bad[..4].copy_from_slice(&(-5i32).to_be_bytes());
        peer.write_all(&bad).unwrap();
        assert!(matches!(sio.read_step(), ReadOutcome::Error(Errno::EPROTO)));
    }

    #[test]
    fn write_drains_pending_event() {
        let (sock, peer) = pair();
        let mut sio = SocketIo::new(sock.as_raw_fd(), false);
        let msg = build_request(3, &[&42i32.to_be_bytes()]);
        sio.write_event = Some(ProxyEvent::with_message(
            EventKind::IoWrite,
            false,
            msg.clone(),
        ));
        assert_eq!(sio.write_step(), WriteOutcome::Done);
        assert!(sio.write_event.is_none());

        use std::io::Read;
        let mut got = vec![0u8; msg.len()];
        let mut peer = peer;
        peer.set_nonblocking(false).unwrap();
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn table_caps_at_max_socket() {
        let mut table = SocketTable::new(1);
        assert!(table.add(10, false).is_ok());
        assert!(table.add(11, false).is_err());
        table.remove(10);
        assert!(table.add(11, true).is_ok());
    }

    #[test]
    fn client_fd_lookup() {
        let mut table = SocketTable::new(4);
        table.add(10, false).unwrap();
        table.get_mut(10).unwrap().addr = SockAddr::Client { client_id: 3 };
        assert_eq!(table.find_fd_by_client(3), Some(10));
        assert_eq!(table.find_fd_by_client(4), None);
    }
}
