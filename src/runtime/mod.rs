//! Event-driven runtime for the socket server.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/write syscalls until they would
//! block. Uses epoll on Linux, kqueue on macOS (via mio, which registers
//! edge-triggered — every readiness event must be fully drained).
//!
//! Components:
//! - `Poller`: readiness multiplexer wrapping `mio::Poll`
//! - `ConnectionTable` / `Connection`: buffered per-connection state
//! - `Acceptor`: listening socket and the drain-accept loop
//! - `EventLoop`: the dispatcher that ties them together

pub(crate) mod acceptor;
pub(crate) mod connection;
pub(crate) mod event_loop;
pub(crate) mod poller;

use mio::Token;

/// Token of the listening socket. Connection tokens are slab keys and
/// stay far below this.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the wake descriptor `stop()` uses to interrupt a blocked poll.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);
