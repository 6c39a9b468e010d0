//! The I/O dispatcher.
//!
//! A single thread polls the multiplexer and routes readiness: the
//! listener token goes to the acceptor, connection tokens to buffered
//! read/write, the waker token only interrupts a blocked poll so the
//! lifecycle flag gets checked. All connection-table and poller mutation
//! happens here; no locking anywhere on the I/O path.
//!
//! Application callbacks run inline. Handler actions (enqueued writes,
//! close requests) are collected through `ServerCtx` and applied after
//! the callback returns, so interest masks always match buffer
//! occupancy when the loop goes back to polling.

use crate::config::Config;
use crate::handler::{CloseReason, ConnectionHandler, ConnectionId, EnqueueError};
use crate::runtime::acceptor::Acceptor;
use crate::runtime::connection::{Connection, ConnectionTable, ReadOutcome};
use crate::runtime::poller::{Poller, PollerError};
use crate::runtime::{LISTENER_TOKEN, WAKER_TOKEN};
use crate::server::Lifecycle;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Handle given to application callbacks for mutating the server.
///
/// Valid only for the duration of the callback. Writes are buffered;
/// the dispatcher flushes them as the socket allows and updates interest
/// masks after the callback returns.
pub struct ServerCtx<'a> {
    connections: &'a mut ConnectionTable,
    touched: &'a mut Vec<ConnectionId>,
}

impl ServerCtx<'_> {
    /// Append bytes to a connection's write buffer.
    ///
    /// Fails with [`EnqueueError::UnknownConnection`] if the connection
    /// no longer exists and [`EnqueueError::WouldBlock`] while the write
    /// buffer is over the high-water mark (until it drains below the
    /// low-water mark).
    pub fn enqueue_write(&mut self, id: ConnectionId, data: &[u8]) -> Result<(), EnqueueError> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(EnqueueError::UnknownConnection(id))?;
        conn.enqueue(data)?;
        self.touched.push(id);
        Ok(())
    }

    /// Request a close. The connection drains its write buffer, then the
    /// descriptor is closed; `on_close` is delivered with
    /// [`CloseReason::LocalClose`].
    pub fn close(&mut self, id: ConnectionId) -> Result<(), EnqueueError> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or(EnqueueError::UnknownConnection(id))?;
        conn.request_close();
        self.touched.push(id);
        Ok(())
    }

    /// Peer address of a live connection.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id).map(|c| c.peer_addr())
    }

    /// Bytes currently queued for write on a live connection.
    pub fn pending_write_bytes(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(id).map(|c| c.pending_write_bytes())
    }
}

/// The event loop driving one server instance.
pub(crate) struct EventLoop<H: ConnectionHandler> {
    poller: Poller,
    acceptor: Acceptor,
    connections: ConnectionTable,
    handler: H,
    lifecycle: Arc<Lifecycle>,
    /// Scratch buffer for read syscalls, reused across connections.
    scratch: Vec<u8>,
    /// Connections touched by handler callbacks, pending interest sync.
    ctx_touched: Vec<ConnectionId>,
    /// The accept cap was hit with backlog left; keep accepting across
    /// loop iterations since edge-triggered readiness will not re-fire.
    accept_pending: bool,
    accept_batch: usize,
    event_capacity: usize,
    high_water: usize,
    low_water: usize,
}

impl<H: ConnectionHandler> EventLoop<H> {
    pub(crate) fn new(
        poller: Poller,
        acceptor: Acceptor,
        handler: H,
        lifecycle: Arc<Lifecycle>,
        config: &Config,
    ) -> Self {
        Self {
            poller,
            acceptor,
            connections: ConnectionTable::new(config.max_connections),
            handler,
            lifecycle,
            scratch: vec![0u8; config.read_chunk.max(1)],
            ctx_touched: Vec::new(),
            accept_pending: false,
            accept_batch: config.accept_batch,
            event_capacity: config.event_capacity,
            high_water: config.high_water,
            low_water: config.low_water,
        }
    }

    /// Recover the handler after the loop has exited.
    pub(crate) fn into_handler(self) -> H {
        self.handler
    }

    /// Poll and dispatch until the lifecycle flips to stopping or the
    /// multiplexer fails. All tracked connections are closed on the way
    /// out.
    pub(crate) fn run(&mut self) -> Result<(), PollerError> {
        let mut events = Events::with_capacity(self.event_capacity);
        debug!("Dispatcher polling");

        loop {
            // While accept debt is outstanding, poll without blocking so
            // pending connection I/O interleaves with accept batches.
            let timeout = if self.accept_pending {
                Some(Duration::ZERO)
            } else {
                None
            };

            if let Err(e) = self.poller.wait(&mut events, timeout) {
                error!(error = %e, "Poll failed");
                self.shutdown();
                return Err(PollerError::Io(e));
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {} // wake-up only; lifecycle checked below
                    LISTENER_TOKEN => self.accept_ready(),
                    Token(id) => self.connection_ready(id, event),
                }
            }

            if self.lifecycle.is_stopping() {
                break;
            }

            if self.accept_pending {
                self.accept_ready();
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Drain the accept backlog, up to the per-iteration cap.
    fn accept_ready(&mut self) {
        self.accept_pending = false;

        for _ in 0..self.accept_batch {
            match self.acceptor.next() {
                Ok(Some((stream, peer_addr))) => self.install_connection(stream, peer_addr),
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return;
                }
            }
        }

        self.accept_pending = true;
    }

    fn install_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let conn = Connection::new(stream, peer_addr, self.high_water, self.low_water);
        let id = match self.connections.insert(conn) {
            Some(id) => id,
            None => {
                warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                return;
            }
        };

        let mut register_failed = false;
        if let Some(conn) = self.connections.get_mut(id) {
            if let Err(e) = self
                .poller
                .register(conn.stream_mut(), Token(id), Interest::READABLE)
            {
                error!(conn_id = id, error = %e, "Failed to register connection");
                register_failed = true;
            }
        }
        if register_failed {
            self.connections.remove(id);
            return;
        }

        debug!(conn_id = id, peer = %peer_addr, "Accepted connection");

        self.ctx_touched.clear();
        {
            let mut ctx = ServerCtx {
                connections: &mut self.connections,
                touched: &mut self.ctx_touched,
            };
            self.handler.on_connect(&mut ctx, id);
        }
        self.apply_ctx_effects();
        self.sync_connection(id);
    }

    fn connection_ready(&mut self, id: ConnectionId, event: &Event) {
        // Stale event for a token finalized earlier in this batch.
        if !self.connections.contains(id) {
            return;
        }
        if event.is_readable() {
            self.on_readable(id);
        }
        if event.is_writable() {
            self.on_writable(id);
        }
    }

    fn on_readable(&mut self, id: ConnectionId) {
        let outcome = {
            let Some(conn) = self.connections.get_mut(id) else {
                return;
            };
            if conn.is_closing() {
                return;
            }
            conn.fill(&mut self.scratch)
        };

        match outcome {
            Ok(ReadOutcome::Drained(n)) => {
                trace!(conn_id = id, bytes = n, "Drained socket");
                self.deliver(id);
                self.sync_connection(id);
            }
            Ok(ReadOutcome::PeerClosed(n)) => {
                // Deliver what arrived before the half-close, then tear
                // down; the write buffer still drains to the peer.
                trace!(conn_id = id, bytes = n, "Peer half-closed");
                self.deliver(id);
                self.begin_close(id, CloseReason::PeerClosed);
                self.sync_connection(id);
            }
            Err(e) => self.close_on_error(id, e),
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let result = match self.connections.get_mut(id) {
            Some(conn) => conn.flush(),
            None => return,
        };
        match result {
            Ok(_) => self.sync_connection(id),
            Err(e) => self.close_on_error(id, e),
        }
    }

    /// Hand accumulated read-buffer bytes to the handler. Only the
    /// consumed prefix is discarded; the rest waits for more data.
    fn deliver(&mut self, id: ConnectionId) {
        let buf = match self.connections.get_mut(id) {
            Some(conn) if conn.has_read_data() => conn.take_read_buf(),
            _ => return,
        };

        self.ctx_touched.clear();
        let consumed = {
            let mut ctx = ServerCtx {
                connections: &mut self.connections,
                touched: &mut self.ctx_touched,
            };
            self.handler.on_data(&mut ctx, id, &buf)
        };

        let mut buf = buf;
        if consumed > buf.len() {
            warn!(
                conn_id = id,
                consumed,
                delivered = buf.len(),
                "Handler consumed more than delivered"
            );
            buf.clear();
        } else {
            use bytes::Buf;
            buf.advance(consumed);
        }
        if let Some(conn) = self.connections.get_mut(id) {
            conn.restore_read_buf(buf);
        }

        self.apply_ctx_effects();
    }

    /// Apply close requests and interest changes accumulated by handler
    /// callbacks.
    fn apply_ctx_effects(&mut self) {
        let mut touched = std::mem::take(&mut self.ctx_touched);
        for id in touched.drain(..) {
            let close_now = self
                .connections
                .get(id)
                .map(|c| c.close_requested() && !c.is_closing())
                .unwrap_or(false);
            if close_now {
                self.begin_close(id, CloseReason::LocalClose);
            }
            self.sync_connection(id);
        }
        self.ctx_touched = touched;
    }

    /// Enter teardown and deliver `on_close` the first time.
    fn begin_close(&mut self, id: ConnectionId, reason: CloseReason) {
        let report = match self.connections.get_mut(id) {
            Some(conn) => conn.begin_close(),
            None => false,
        };
        if report {
            debug!(conn_id = id, reason = ?reason, "Connection closing");
            self.handler.on_close(id, reason);
        }
    }

    /// Close a connection whose socket failed. Queued output is
    /// discarded; the descriptor cannot be trusted to drain it.
    fn close_on_error(&mut self, id: ConnectionId, e: io::Error) {
        debug!(conn_id = id, error = %e, "Connection I/O error");
        if let Some(conn) = self.connections.get_mut(id) {
            conn.discard_write_buf();
        }
        self.begin_close(id, CloseReason::Error(e.kind()));
        self.finalize(id);
    }

    /// Reconcile a connection's registered interest with the interest
    /// implied by its buffers and closing state. A connection that wants
    /// nothing is finished and gets finalized.
    fn sync_connection(&mut self, id: ConnectionId) {
        let desired = match self.connections.get(id) {
            Some(conn) => conn.desired_interest(),
            None => return,
        };

        match desired {
            None => self.finalize(id),
            Some(want) => {
                let mut failed = false;
                if let Some(conn) = self.connections.get_mut(id) {
                    if want != conn.current_interest() {
                        match self.poller.modify(conn.stream_mut(), Token(id), want) {
                            Ok(()) => conn.set_current_interest(want),
                            Err(e) => {
                                error!(conn_id = id, error = %e, "Failed to update interest");
                                failed = true;
                            }
                        }
                    }
                }
                if failed {
                    self.begin_close(id, CloseReason::Error(io::ErrorKind::Other));
                    self.finalize(id);
                }
            }
        }
    }

    /// Unregister, remove from the table, and close the descriptor.
    fn finalize(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };
        if let Err(e) = self.poller.unregister(conn.stream_mut(), Token(id)) {
            warn!(conn_id = id, error = %e, "Failed to deregister connection");
        }
        debug!(conn_id = id, peer = %conn.peer_addr(), "Connection closed");
        // Dropping the connection closes the socket.
    }

    /// Close every tracked connection and the listener on loop exit.
    fn shutdown(&mut self) {
        let open = self.connections.len();
        if open > 0 {
            info!(connections = open, "Closing all connections");
        }
        let ids = self.connections.ids();
        for id in ids {
            self.begin_close(id, CloseReason::ServerStopped);
            self.finalize(id);
        }
        if let Err(e) = self
            .poller
            .unregister(self.acceptor.listener_mut(), LISTENER_TOKEN)
        {
            warn!(error = %e, "Failed to deregister listener");
        }
        debug_assert_eq!(self.poller.registered_count(), 0);
    }
}
