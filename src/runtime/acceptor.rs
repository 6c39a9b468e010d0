//! Listening socket and the drain-accept loop.
//!
//! The acceptor owns the bound, listening descriptor. On readiness the
//! dispatcher calls `next()` repeatedly until the backlog is exhausted
//! or the per-event accept cap is reached.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use tracing::warn;

const LISTEN_BACKLOG: i32 = 1024;

/// Owner of the listening socket.
pub(crate) struct Acceptor {
    listener: TcpListener,
    tcp_nodelay: bool,
}

impl Acceptor {
    /// Bind and listen on `addr`. The socket is non-blocking with
    /// SO_REUSEADDR set, so restarts do not trip over TIME_WAIT.
    pub(crate) fn bind(addr: SocketAddr, tcp_nodelay: bool) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener: TcpListener::from_std(socket.into()),
            tcp_nodelay,
        })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub(crate) fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept one pending connection.
    ///
    /// `Ok(None)` means the backlog is exhausted for this readiness
    /// event: either the accept would block, or the process is out of
    /// descriptors (logged, retried on the next readiness event rather
    /// than spinning). Interrupted and aborted-in-backlog accepts are
    /// retried immediately. Any other error is fatal to this acceptor
    /// invocation only, never to the server.
    pub(crate) fn next(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.tcp_nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                    }
                    return Ok(Some((stream, peer_addr)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(ref e) if is_fd_exhaustion(e) => {
                    warn!(error = %e, "Out of file descriptors, pausing accept");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// EMFILE/ENFILE have no stable `io::ErrorKind` mapping.
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn accept_one(acceptor: &mut Acceptor) -> (TcpStream, SocketAddr) {
        // Accepts race the client's connect landing in the backlog.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(accepted) = acceptor.next().unwrap() {
                return accepted;
            }
            assert!(Instant::now() < deadline, "timed out waiting for accept");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_bind_ephemeral_and_local_addr() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_drains_backlog_then_would_block() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let clients: Vec<std::net::TcpStream> = (0..3)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();

        let mut accepted = Vec::new();
        for _ in 0..clients.len() {
            accepted.push(accept_one(&mut acceptor));
        }

        // Backlog exhausted.
        assert!(acceptor.next().unwrap().is_none());
        assert_eq!(accepted.len(), clients.len());
    }
}
