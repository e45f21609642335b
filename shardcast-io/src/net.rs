//! Listener construction and per-fd socket knobs. Listeners hand raw fds to
//! the reactor; accepted connections are immediately marked nonblocking.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::info;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use socket2::{Domain, Socket, Type};

use crate::IoSetupError;

/// Binds a nonblocking TCP listener with SO_REUSEADDR.
pub fn tcp_listener(addr: &str) -> Result<TcpListener, IoSetupError> {
    let parsed: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| IoSetupError::Socket(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    let socket =
        Socket::new(Domain::for_address(parsed), Type::STREAM, None).map_err(IoSetupError::Socket)?;
    socket.set_reuse_address(true).map_err(IoSetupError::Socket)?;
    socket.bind(&parsed.into()).map_err(IoSetupError::Socket)?;
    socket.listen(128).map_err(IoSetupError::Socket)?;
    socket.set_nonblocking(true).map_err(IoSetupError::Socket)?;
    let listener: TcpListener = socket.into();
    info!("client listener bound to {} (fd: {})", addr, listener.as_raw_fd());
    Ok(listener)
}

/// Binds a nonblocking Unix-domain listener, replacing any stale socket file.
pub fn unix_listener(path: &Path) -> Result<UnixListener, IoSetupError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(IoSetupError::Socket)?;
    }
    let listener = UnixListener::bind(path).map_err(IoSetupError::Socket)?;
    listener.set_nonblocking(true).map_err(IoSetupError::Socket)?;
    info!(
        "cas listener bound to {} (fd: {})",
        path.display(),
        listener.as_raw_fd()
    );
    Ok(listener)
}

/// Accepts one connection from a nonblocking TCP listener, returning the raw
/// fd already in nonblocking mode. `Ok(None)` when the queue is drained.
pub fn accept_tcp(listener: &TcpListener) -> Result<Option<RawFd>, IoSetupError> {
    match listener.accept() {
        Ok((stream, _)) => Ok(Some(into_nonblocking_fd(stream)?)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(IoSetupError::Socket(e)),
    }
}

pub fn accept_unix(listener: &UnixListener) -> Result<Option<RawFd>, IoSetupError> {
    match listener.accept() {
        Ok((stream, _)) => {
            stream.set_nonblocking(true).map_err(IoSetupError::Socket)?;
            Ok(Some(stream.into_raw_fd()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(IoSetupError::Socket(e)),
    }
}

fn into_nonblocking_fd(stream: TcpStream) -> Result<RawFd, IoSetupError> {
    stream.set_nonblocking(true).map_err(IoSetupError::Socket)?;
    stream.set_nodelay(true).map_err(IoSetupError::Socket)?;
    Ok(stream.into_raw_fd())
}

/// Marks an fd received from outside (broker hand-off) nonblocking.
pub fn set_nonblocking(fd: RawFd) -> Result<(), IoSetupError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| IoSetupError::Socket(e.into()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| IoSetupError::Socket(e.into()))?;
    Ok(())
}

/// Closes a raw fd owned by the socket table.
pub fn close_fd(fd: RawFd) {
    // Reconstruct ownership so the fd is closed exactly once.
    drop(unsafe { UnixStream::from_raw_fd(fd) });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_listener_is_nonblocking() {
        let listener = tcp_listener("127.0.0.1:0").unwrap();
        assert!(accept_tcp(&listener).unwrap().is_none());
    }

    #[test]
    fn unix_listener_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("shardcast-net-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cas.sock");
        let first = unix_listener(&path).unwrap();
        drop(first);
        let second = unix_listener(&path).unwrap();
        assert!(accept_unix(&second).unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn accepted_fd_is_usable() {
        let listener = tcp_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let fd = loop {
            if let Some(fd) = accept_tcp(&listener).unwrap() {
                break fd;
            }
        };
        assert!(fd >= 0);
        close_fd(fd);
    }
}
