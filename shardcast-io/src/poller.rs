//! Thin epoll wrapper. One instance drives every socket the proxy owns;
//! the engine stays single-threaded and only this poller ever blocks.

use std::os::unix::io::{BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::IoSetupError;

/// Readiness interest for one descriptor. Read interest stays on for the
/// lifetime of a registration; write interest is toggled with the pending
/// write slot (backpressure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    fn flags(self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLRDHUP;
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// What the kernel reported for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub fn new() -> Result<Self, IoSetupError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(IoSetupError::Epoll)?;
        Ok(Self { epoll })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> Result<(), IoSetupError> {
        let event = EpollEvent::new(interest.flags(), fd as u64);
        // SAFETY: fd is owned by the caller's socket table and outlives the
        // registration; deregister() runs before close.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, event).map_err(IoSetupError::Epoll)
    }

    pub fn rearm(&self, fd: RawFd, interest: Interest) -> Result<(), IoSetupError> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .modify(borrowed, &mut event)
            .map_err(IoSetupError::Epoll)
    }

    pub fn deregister(&self, fd: RawFd) -> Result<(), IoSetupError> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed).map_err(IoSetupError::Epoll)
    }

    /// Waits up to `timeout_ms` and appends `(fd, readiness)` pairs to `out`.
    /// EINTR is reported as zero events so the caller just ticks again.
    pub fn wait(
        &self,
        out: &mut Vec<(RawFd, Readiness)>,
        timeout_ms: isize,
    ) -> Result<usize, IoSetupError> {
        let mut events = [EpollEvent::empty(); 256];
        let n = match self.epoll.wait(&mut events, timeout_ms) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(IoSetupError::Epoll(e)),
        };
        for event in &events[..n] {
            let flags = event.events();
            out.push((
                event.data() as RawFd,
                Readiness {
                    readable: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                    error: flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP),
                },
            ));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readiness_follows_interest() {
        let poller = Poller::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        poller.register(b.as_raw_fd(), Interest::READ).unwrap();

        let mut out = Vec::new();
        poller.wait(&mut out, 0).unwrap();
        assert!(out.is_empty());

        a.write_all(b"x").unwrap();
        poller.wait(&mut out, 1000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, b.as_raw_fd());
        assert!(out[0].1.readable);

        out.clear();
        poller.rearm(b.as_raw_fd(), Interest::READ_WRITE).unwrap();
        poller.wait(&mut out, 1000).unwrap();
        assert!(out[0].1.writable);

        poller.deregister(b.as_raw_fd()).unwrap();
    }

    #[test]
    fn peer_close_reports_readable() {
        let poller = Poller::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        poller.register(b.as_raw_fd(), Interest::READ).unwrap();
        drop(a);

        let mut out = Vec::new();
        poller.wait(&mut out, 1000).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].1.readable);
    }
}
