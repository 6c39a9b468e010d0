//! Application-facing callback interface.
//!
//! The server core delivers raw byte-stream events to a single
//! [`ConnectionHandler`] implementation. All callbacks run inline on the
//! dispatcher thread: they must not block, or every other connection
//! stalls. The only server mutation allowed from inside a callback goes
//! through [`ServerCtx`](crate::ServerCtx).

use std::io;

/// Identifier of an accepted connection, stable for its lifetime.
///
/// Identifiers are reused after a connection closes.
pub type ConnectionId = usize;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed or half-closed the connection.
    PeerClosed,
    /// A read or write against the socket failed.
    Error(io::ErrorKind),
    /// The application requested the close via `ServerCtx::close`.
    LocalClose,
    /// The server is shutting down.
    ServerStopped,
}

/// Error returned by `ServerCtx::enqueue_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The connection is not (or no longer) in the connection table.
    UnknownConnection(ConnectionId),
    /// The connection's write buffer is over the high-water mark.
    /// The enqueue is rejected until the buffer drains below the
    /// low-water mark.
    WouldBlock,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::UnknownConnection(id) => {
                write!(f, "unknown connection {}", id)
            }
            EnqueueError::WouldBlock => {
                write!(f, "write buffer over high-water mark")
            }
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Byte-stream events delivered by the server core.
///
/// Framing is entirely the implementor's responsibility: `on_data` hands
/// over everything buffered so far and the implementor reports how much
/// of it was consumed. The unconsumed suffix is kept and redelivered,
/// with any newly arrived bytes appended, on the next readable event.
pub trait ConnectionHandler {
    /// A connection was accepted and registered.
    fn on_connect(&mut self, ctx: &mut crate::ServerCtx<'_>, id: ConnectionId) {
        let _ = (ctx, id);
    }

    /// Buffered bytes are available on `id`.
    ///
    /// Returns the number of bytes consumed from the front of `data`.
    /// Returning less than `data.len()` keeps the remainder buffered for
    /// partial-message reassembly.
    fn on_data(&mut self, ctx: &mut crate::ServerCtx<'_>, id: ConnectionId, data: &[u8]) -> usize;

    /// The connection entered teardown. Delivered exactly once, possibly
    /// while the connection's write buffer is still draining to the peer.
    fn on_close(&mut self, id: ConnectionId, reason: CloseReason) {
        let _ = (id, reason);
    }
}
