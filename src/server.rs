//! Server facade: the start/stop/is_started lifecycle surface.
//!
//! A `Server` owns the application handler and, while running, the
//! dispatcher thread driving all I/O. Lifecycle transitions
//! (STOPPED, STARTING, RUNNING, STOPPING) are published through an
//! atomic so `is_started` is safe from any thread; `stop` interrupts a
//! blocked poll through a waker and joins the dispatcher before
//! returning, so when it succeeds the server is fully stopped.
//!
//! Servers are plain values: any number of independent instances can
//! run in one process, and a stopped server can be started again.

use crate::config::Config;
use crate::handler::ConnectionHandler;
use crate::runtime::acceptor::Acceptor;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::poller::Poller;
use crate::runtime::{LISTENER_TOKEN, WAKER_TOKEN};
use mio::{Interest, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{error, info, warn};

/// Lifecycle states of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Lifecycle flag shared between the facade and the dispatcher thread.
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Stopped as u8),
        }
    }

    pub(crate) fn set(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            0 => State::Stopped,
            1 => State::Starting,
            2 => State::Running,
            _ => State::Stopping,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.get() == State::Stopping
    }
}

/// Server lifecycle errors.
#[derive(Debug)]
pub enum ServerError {
    /// `start` was called while the server is not stopped.
    AlreadyStarted,
    /// `stop` was called while the server is not started.
    NotStarted,
    /// Binding the listening socket failed.
    Bind(io::Error),
    /// Creating or wiring the multiplexer, waker, or dispatcher thread
    /// failed.
    Io(io::Error),
    /// The dispatcher thread panicked; the handler is lost and the
    /// server cannot be restarted.
    Faulted,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::AlreadyStarted => write!(f, "server is already started"),
            ServerError::NotStarted => write!(f, "server is not started"),
            ServerError::Bind(e) => write!(f, "failed to bind listening socket: {}", e),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Faulted => write!(f, "dispatcher thread panicked"),
        }
    }
}

impl std::error::Error for ServerError {}

/// State held only while the dispatcher thread is alive.
struct Running<H> {
    handle: thread::JoinHandle<H>,
    waker: Waker,
    local_addr: SocketAddr,
}

/// An event-driven TCP socket server.
///
/// Construction takes the application handler and optionally a
/// [`Config`]; no configuration is required. The handler is moved onto
/// the dispatcher thread for the lifetime of a run and handed back on
/// `stop`, so one server instance can be started and stopped repeatedly.
pub struct Server<H: ConnectionHandler + Send + 'static> {
    config: Config,
    handler: Option<H>,
    lifecycle: Arc<Lifecycle>,
    running: Option<Running<H>>,
}

impl<H: ConnectionHandler + Send + 'static> Server<H> {
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, Config::default())
    }

    pub fn with_config(handler: H, config: Config) -> Self {
        Self {
            config,
            handler: Some(handler),
            lifecycle: Arc::new(Lifecycle::new()),
            running: None,
        }
    }

    /// Bind `config.host:port`, launch the dispatcher, and return once
    /// the loop is polling.
    ///
    /// Port 0 binds an ephemeral port; use [`Server::local_addr`] to
    /// discover it. Fails with `AlreadyStarted` if the server is not
    /// stopped; bind and multiplexer failures surface here with no
    /// partial state left behind.
    pub fn start(&mut self, port: u16) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let handler = match self.handler.take() {
            Some(h) => h,
            None => return Err(ServerError::Faulted),
        };

        self.lifecycle.set(State::Starting);
        match self.launch(port, handler) {
            Ok(running) => {
                info!(addr = %running.local_addr, "Server started");
                self.running = Some(running);
                Ok(())
            }
            Err((e, handler)) => {
                self.lifecycle.set(State::Stopped);
                self.handler = handler;
                Err(e)
            }
        }
    }

    /// Setup half of `start`. On failure the handler is returned so the
    /// server stays restartable (unless the dispatcher consumed it).
    fn launch(&mut self, port: u16, handler: H) -> Result<Running<H>, (ServerError, Option<H>)> {
        let addr: SocketAddr = match format!("{}:{}", self.config.host, port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                let err = io::Error::new(io::ErrorKind::InvalidInput, e.to_string());
                return Err((ServerError::Bind(err), Some(handler)));
            }
        };

        let mut poller = match Poller::new() {
            Ok(p) => p,
            Err(e) => return Err((ServerError::Io(e), Some(handler))),
        };
        let mut acceptor = match Acceptor::bind(addr, self.config.tcp_nodelay) {
            Ok(a) => a,
            Err(e) => return Err((ServerError::Bind(e), Some(handler))),
        };
        if let Err(e) = poller.register(acceptor.listener_mut(), LISTENER_TOKEN, Interest::READABLE)
        {
            return Err((ServerError::Io(e.into_io()), Some(handler)));
        }
        let waker = match poller.waker(WAKER_TOKEN) {
            Ok(w) => w,
            Err(e) => return Err((ServerError::Io(e), Some(handler))),
        };
        let local_addr = match acceptor.local_addr() {
            Ok(a) => a,
            Err(e) => return Err((ServerError::Io(e), Some(handler))),
        };

        let lifecycle = Arc::clone(&self.lifecycle);
        let (ready_tx, ready_rx) = mpsc::channel();
        let mut event_loop = EventLoop::new(
            poller,
            acceptor,
            handler,
            Arc::clone(&self.lifecycle),
            &self.config,
        );

        let spawn = thread::Builder::new()
            .name("shoal-dispatcher".to_string())
            .spawn(move || {
                lifecycle.set(State::Running);
                let _ = ready_tx.send(());
                if let Err(e) = event_loop.run() {
                    error!(error = %e, "Dispatcher loop failed");
                }
                lifecycle.set(State::Stopping);
                event_loop.into_handler()
            });

        let handle = match spawn {
            Ok(h) => h,
            // The closure (and with it the handler) was dropped.
            Err(e) => return Err((ServerError::Io(e), None)),
        };

        match ready_rx.recv() {
            Ok(()) => Ok(Running {
                handle,
                waker,
                local_addr,
            }),
            Err(_) => {
                // The dispatcher died before signalling readiness.
                let handler = handle.join().ok();
                Err((ServerError::Faulted, handler))
            }
        }
    }

    /// Signal the dispatcher to unwind, close all connections and the
    /// listener, and join the thread. Returns once the server is fully
    /// stopped.
    ///
    /// Fails with `NotStarted` if no dispatcher is live; in that case
    /// nothing is changed.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let running = self.running.take().ok_or(ServerError::NotStarted)?;

        self.lifecycle.set(State::Stopping);
        if let Err(e) = running.waker.wake() {
            warn!(error = %e, "Failed to wake dispatcher");
        }

        match running.handle.join() {
            Ok(handler) => {
                self.handler = Some(handler);
                self.lifecycle.set(State::Stopped);
                info!("Server stopped");
                Ok(())
            }
            Err(_) => {
                self.lifecycle.set(State::Stopped);
                Err(ServerError::Faulted)
            }
        }
    }

    /// True only while the dispatcher loop is running. If the loop dies
    /// on a fatal error this turns false on its own; `stop` still
    /// reclaims the thread.
    pub fn is_started(&self) -> bool {
        self.lifecycle.get() == State::Running
    }

    /// Address the listener is bound to, while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

impl<H: ConnectionHandler + Send + 'static> Drop for Server<H> {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Failed to stop server on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CloseReason, ConnectionId};
    use crate::ServerCtx;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestEvent {
        Connect(ConnectionId),
        Data(ConnectionId, Vec<u8>),
        Close(ConnectionId, CloseReason),
    }

    #[derive(Clone, Copy)]
    enum Mode {
        /// Echo everything, consume everything.
        EchoAll,
        /// Reply b"PONG" to any delivery.
        ReplyPong,
        /// Reply b"BYE" to any delivery.
        ReplyBye,
        /// Consume only whole lines, leave the rest buffered.
        Lines,
        /// Send b"HELLO" on connect.
        Greet,
        /// Consume and discard.
        Sink,
        /// Consume, then request a local close.
        CloseAfterData,
    }

    struct Recorder {
        log: Arc<Mutex<Vec<TestEvent>>>,
        mode: Mode,
    }

    impl ConnectionHandler for Recorder {
        fn on_connect(&mut self, ctx: &mut ServerCtx<'_>, id: ConnectionId) {
            self.log.lock().unwrap().push(TestEvent::Connect(id));
            if matches!(self.mode, Mode::Greet) {
                ctx.enqueue_write(id, b"HELLO").unwrap();
            }
        }

        fn on_data(&mut self, ctx: &mut ServerCtx<'_>, id: ConnectionId, data: &[u8]) -> usize {
            self.log
                .lock()
                .unwrap()
                .push(TestEvent::Data(id, data.to_vec()));
            match self.mode {
                Mode::EchoAll => {
                    ctx.enqueue_write(id, data).unwrap();
                    data.len()
                }
                Mode::ReplyPong => {
                    ctx.enqueue_write(id, b"PONG").unwrap();
                    data.len()
                }
                Mode::ReplyBye => {
                    ctx.enqueue_write(id, b"BYE").unwrap();
                    data.len()
                }
                Mode::Lines => match data.iter().rposition(|&b| b == b'\n') {
                    Some(pos) => pos + 1,
                    None => 0,
                },
                Mode::Greet | Mode::Sink => data.len(),
                Mode::CloseAfterData => {
                    ctx.close(id).unwrap();
                    data.len()
                }
            }
        }

        fn on_close(&mut self, id: ConnectionId, reason: CloseReason) {
            self.log.lock().unwrap().push(TestEvent::Close(id, reason));
        }
    }

    fn start_server(mode: Mode) -> (Server<Recorder>, Arc<Mutex<Vec<TestEvent>>>, SocketAddr) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            log: Arc::clone(&log),
            mode,
        };
        let mut server = Server::new(handler);
        server.start(0).unwrap();
        let addr = server.local_addr().unwrap();
        (server, log, addr)
    }

    fn wait_for(log: &Arc<Mutex<Vec<TestEvent>>>, pred: impl Fn(&[TestEvent]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&log.lock().unwrap()) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out, events: {:?}",
                log.lock().unwrap()
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_lifecycle_start_stop_restart() {
        let (mut server, _log, _addr) = start_server(Mode::Sink);
        assert!(server.is_started());
        assert!(server.local_addr().is_some());

        server.stop().unwrap();
        assert!(!server.is_started());
        assert!(server.local_addr().is_none());

        // A stopped server can be started again.
        server.start(0).unwrap();
        assert!(server.is_started());
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_when_stopped_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut server = Server::new(Recorder {
            log,
            mode: Mode::Sink,
        });

        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));
        assert!(!server.is_started());

        server.start(0).unwrap();
        server.stop().unwrap();
        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut server, _log, _addr) = start_server(Mode::Sink);
        assert!(matches!(server.start(0), Err(ServerError::AlreadyStarted)));
        server.stop().unwrap();
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let (mut server, log, addr) = start_server(Mode::ReplyPong);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"PING").unwrap();

        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Data(_, data) if data == b"PING"))
        });
        assert_eq!(read_exact(&mut client, 4), b"PONG");

        server.stop().unwrap();
    }

    #[test]
    fn test_partial_consumption_reassembles_lines() {
        let (mut server, log, addr) = start_server(Mode::Lines);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"HEL").unwrap();

        // First delivery has no newline; the handler consumes nothing.
        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Data(_, data) if data == b"HEL"))
        });

        // The unconsumed prefix must be redelivered concatenated with
        // the newly arrived bytes.
        client.write_all(b"LO\n").unwrap();
        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Data(_, data) if data == b"HELLO\n"))
        });

        server.stop().unwrap();
    }

    #[test]
    fn test_half_close_delivers_data_then_close() {
        let (mut server, log, addr) = start_server(Mode::ReplyBye);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"DATA").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Close(_, CloseReason::PeerClosed)))
        });

        // Data precedes the close notification.
        {
            let events = log.lock().unwrap();
            let data_pos = events
                .iter()
                .position(|e| matches!(e, TestEvent::Data(_, data) if data == b"DATA"))
                .expect("data event");
            let close_pos = events
                .iter()
                .position(|e| matches!(e, TestEvent::Close(_, CloseReason::PeerClosed)))
                .expect("close event");
            assert!(data_pos < close_pos);
        }

        // The queued response still reaches the peer before the FIN.
        assert_eq!(read_exact(&mut client, 3), b"BYE");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop().unwrap();
    }

    #[test]
    fn test_greeting_sent_from_on_connect() {
        let (mut server, _log, addr) = start_server(Mode::Greet);

        let mut client = TcpStream::connect(addr).unwrap();
        assert_eq!(read_exact(&mut client, 5), b"HELLO");

        server.stop().unwrap();
    }

    #[test]
    fn test_local_close_drains_then_closes() {
        let (mut server, log, addr) = start_server(Mode::CloseAfterData);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"X").unwrap();

        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Close(_, CloseReason::LocalClose)))
        });

        // Server side closed the connection.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop().unwrap();
    }

    #[test]
    fn test_burst_of_clients_all_echoed() {
        // A small accept batch forces the dispatcher to carry accept
        // debt across loop iterations.
        let config = Config {
            accept_batch: 4,
            ..Config::default()
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Recorder {
            log: Arc::clone(&log),
            mode: Mode::EchoAll,
        };
        let mut server = Server::with_config(handler, config);
        server.start(0).unwrap();
        let addr = server.local_addr().unwrap();

        let mut clients: Vec<TcpStream> = (0..32).map(|_| TcpStream::connect(addr).unwrap()).collect();
        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(&[i as u8]).unwrap();
        }
        for (i, client) in clients.iter_mut().enumerate() {
            assert_eq!(read_exact(client, 1), vec![i as u8]);
        }

        wait_for(&log, |events| {
            events
                .iter()
                .filter(|e| matches!(e, TestEvent::Data(_, _)))
                .count()
                >= 32
        });

        server.stop().unwrap();
    }

    #[test]
    fn test_stop_closes_connections_with_reason() {
        let (mut server, log, addr) = start_server(Mode::Sink);

        let _client = TcpStream::connect(addr).unwrap();
        wait_for(&log, |events| {
            events
                .iter()
                .any(|e| matches!(e, TestEvent::Connect(_)))
        });

        server.stop().unwrap();

        // stop is synchronous: the close is already in the log.
        let events = log.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, TestEvent::Close(_, CloseReason::ServerStopped))));
    }

    #[test]
    fn test_independent_servers_coexist() {
        let (mut a, _log_a, addr_a) = start_server(Mode::ReplyPong);
        let (mut b, _log_b, addr_b) = start_server(Mode::Greet);
        assert_ne!(addr_a, addr_b);

        let mut client_b = TcpStream::connect(addr_b).unwrap();
        assert_eq!(read_exact(&mut client_b, 5), b"HELLO");

        let mut client_a = TcpStream::connect(addr_a).unwrap();
        client_a.write_all(b"PING").unwrap();
        assert_eq!(read_exact(&mut client_a, 4), b"PONG");

        a.stop().unwrap();
        b.stop().unwrap();
    }
}
