//! Connection state and the connection table.
//!
//! Each connection owns its socket, a read buffer (append on read,
//! consume on delivery) and a write buffer (append on enqueue, consume
//! on flush), plus the interest mask currently registered with the
//! poller. Connection lifetime is exclusively owned by the table; the
//! poller only ever sees the token.

use crate::handler::EnqueueError;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Outcome of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The socket would block; `0` bytes read is a spurious wakeup.
    Drained(usize),
    /// The peer half-closed (zero-length read) after `0..n` bytes.
    PeerClosed(usize),
}

/// Outcome of flushing the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// The write buffer is empty.
    Drained,
    /// The socket would block with bytes still queued.
    Pending,
}

/// A single buffered client connection.
///
/// The reading and writing directions are independent: `closing` marks
/// the whole connection for teardown (peer half-close, local close
/// request, I/O error, or server shutdown), after which the write buffer
/// is still allowed to drain before the descriptor is closed.
pub(crate) struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Interest mask currently registered with the poller.
    interest: Interest,
    closing: bool,
    close_reported: bool,
    /// Local close requested from inside a handler callback.
    close_requested: bool,
    /// Set while write-buffer occupancy is over the high-water mark.
    paused: bool,
    high_water: usize,
    low_water: usize,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        high_water: usize,
        low_water: usize,
    ) -> Self {
        Self {
            stream,
            peer_addr,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            interest: Interest::READABLE,
            closing: false,
            close_reported: false,
            close_requested: false,
            paused: false,
            high_water,
            low_water,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Enter teardown. Returns `true` the first time, when the caller
    /// must deliver the close notification to the application.
    pub(crate) fn begin_close(&mut self) -> bool {
        self.closing = true;
        if self.close_reported {
            false
        } else {
            self.close_reported = true;
            true
        }
    }

    /// Drop any queued output. Used when the socket is no longer
    /// trustworthy (read/write error) and draining would be pointless.
    pub(crate) fn discard_write_buf(&mut self) {
        self.write_buf.clear();
    }

    /// Drain the socket into the read buffer until it would block, the
    /// peer half-closes, or an error occurs.
    pub(crate) fn fill(&mut self, scratch: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut total = 0;
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed(total)),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained(total))
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn has_read_data(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Take the accumulated read buffer for delivery to the handler.
    /// The unconsumed suffix must be handed back via `restore_read_buf`.
    pub(crate) fn take_read_buf(&mut self) -> BytesMut {
        std::mem::take(&mut self.read_buf)
    }

    /// Hand back the unconsumed remainder of a delivery. New bytes read
    /// after this are appended behind it, preserving stream order.
    pub(crate) fn restore_read_buf(&mut self, buf: BytesMut) {
        debug_assert!(self.read_buf.is_empty());
        self.read_buf = buf;
    }

    /// Append bytes to the write buffer.
    ///
    /// Fails with `WouldBlock` while paused. The enqueue that pushes
    /// occupancy to the high-water mark is accepted and sets the pause;
    /// the pause clears when a flush drains occupancy to the low-water
    /// mark.
    pub(crate) fn enqueue(&mut self, data: &[u8]) -> Result<(), EnqueueError> {
        if self.paused {
            return Err(EnqueueError::WouldBlock);
        }
        self.write_buf.extend_from_slice(data);
        if self.write_buf.len() >= self.high_water {
            self.paused = true;
        }
        Ok(())
    }

    /// Write queued bytes until the socket would block or the buffer
    /// drains.
    pub(crate) fn flush(&mut self) -> io::Result<FlushOutcome> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ))
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.paused && self.write_buf.len() <= self.low_water {
            self.paused = false;
        }
        if self.write_buf.is_empty() {
            Ok(FlushOutcome::Drained)
        } else {
            Ok(FlushOutcome::Pending)
        }
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn pending_write_bytes(&self) -> usize {
        self.write_buf.len()
    }

    /// The interest mask implied by the current state: readable while the
    /// connection is open, writable while output is queued. `None` means
    /// the connection is finished and must be finalized.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        let mut want = if self.closing {
            None
        } else {
            Some(Interest::READABLE)
        };
        if !self.write_buf.is_empty() {
            want = Some(match want {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        want
    }

    pub(crate) fn current_interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn set_current_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove. Single-threaded access
/// only; all mutation happens on the dispatcher thread.
pub(crate) struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection. Returns `None` at capacity.
    pub(crate) fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub(crate) fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    pub(crate) fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// A connected (server-side mio, client-side std) socket pair.
    fn pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn connection(high_water: usize, low_water: usize) -> (Connection, std::net::TcpStream) {
        let (stream, client) = pair();
        let peer = client.local_addr().unwrap();
        (Connection::new(stream, peer, high_water, low_water), client)
    }

    /// Drive `fill` until `pred` holds or the deadline passes. Data sent
    /// by the client side is in flight, so a single fill may race it.
    fn fill_until(
        conn: &mut Connection,
        scratch: &mut [u8],
        pred: impl Fn(&Connection, ReadOutcome) -> bool,
    ) -> ReadOutcome {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let outcome = conn.fill(scratch).unwrap();
            if pred(conn, outcome) {
                return outcome;
            }
            assert!(Instant::now() < deadline, "timed out waiting for socket data");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_fill_accumulates_and_reports_half_close() {
        use std::io::Write as _;
        use std::net::Shutdown;

        let (mut conn, mut client) = connection(1024, 256);
        let mut scratch = [0u8; 64];

        client.write_all(b"PING").unwrap();
        fill_until(&mut conn, &mut scratch, |c, _| c.has_read_data());
        assert_eq!(&conn.take_read_buf()[..], b"PING");

        client.shutdown(Shutdown::Write).unwrap();
        let outcome = fill_until(&mut conn, &mut scratch, |_, o| {
            matches!(o, ReadOutcome::PeerClosed(_))
        });
        assert!(matches!(outcome, ReadOutcome::PeerClosed(_)));
    }

    #[test]
    fn test_restore_preserves_unconsumed_prefix_order() {
        use std::io::Write as _;

        let (mut conn, mut client) = connection(1024, 256);
        let mut scratch = [0u8; 64];

        client.write_all(b"HELLO").unwrap();
        fill_until(&mut conn, &mut scratch, |c, _| c.has_read_data());

        // Handler consumed 2 of 5 bytes; the rest is handed back.
        let mut buf = conn.take_read_buf();
        buf.advance(2);
        conn.restore_read_buf(buf);

        client.write_all(b" WORLD").unwrap();
        fill_until(&mut conn, &mut scratch, |c, _| c.pending_read_len() == 9);
        assert_eq!(&conn.take_read_buf()[..], b"LLO WORLD");
    }

    #[test]
    fn test_enqueue_watermarks() {
        let (mut conn, _client) = connection(8, 4);

        // Below the mark: accepted.
        conn.enqueue(b"abc").unwrap();
        assert!(!conn.is_paused());

        // The enqueue that crosses the mark is accepted and pauses.
        conn.enqueue(b"defgh").unwrap();
        assert!(conn.is_paused());
        assert_eq!(conn.enqueue(b"x"), Err(EnqueueError::WouldBlock));

        // Draining to the low-water mark unpauses. The kernel socket
        // buffer absorbs these 8 bytes without a reader.
        assert_eq!(conn.flush().unwrap(), FlushOutcome::Drained);
        assert!(!conn.is_paused());
        conn.enqueue(b"x").unwrap();
    }

    #[test]
    fn test_desired_interest_follows_buffers_and_close() {
        let (mut conn, _client) = connection(1024, 256);

        assert_eq!(conn.desired_interest(), Some(Interest::READABLE));

        conn.enqueue(b"out").unwrap();
        assert_eq!(
            conn.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        assert!(conn.begin_close());
        assert!(!conn.begin_close()); // reported once
        assert_eq!(conn.desired_interest(), Some(Interest::WRITABLE));

        assert_eq!(conn.flush().unwrap(), FlushOutcome::Drained);
        assert_eq!(conn.desired_interest(), None);
    }

    #[test]
    fn test_table_capacity_and_reuse() {
        let mut table = ConnectionTable::new(2);

        let (c1, _k1) = connection(16, 8);
        let (c2, _k2) = connection(16, 8);
        let (c3, _k3) = connection(16, 8);

        let id1 = table.insert(c1).unwrap();
        let id2 = table.insert(c2).unwrap();
        assert!(table.insert(c3).is_none());
        assert_eq!(table.len(), 2);

        table.remove(id1);
        assert!(!table.contains(id1));
        assert!(table.contains(id2));
        assert!(table.remove(id1).is_none());
        assert_eq!(table.len(), 1);
    }

    impl Connection {
        fn pending_read_len(&self) -> usize {
            self.read_buf.len()
        }
    }
}
