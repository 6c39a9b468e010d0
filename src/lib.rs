//! shoal: a single-threaded, event-driven TCP socket server.
//!
//! The server multiplexes all connections on one dedicated dispatcher
//! thread using readiness notification (epoll on Linux, kqueue on macOS).
//! Applications plug in through the [`ConnectionHandler`] trait and are
//! handed raw byte streams; framing is entirely their concern.
//!
//! Features:
//! - Non-blocking accept/read/write with explicit drain loops
//! - Per-connection read/write buffering with partial-message reassembly
//! - Write back-pressure via high/low water marks
//! - Synchronous `start`/`stop` lifecycle with a poll waker (no busy-wait)
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod handler;
pub mod server;

mod runtime;

pub use config::Config;
pub use handler::{CloseReason, ConnectionHandler, ConnectionId, EnqueueError};
pub use runtime::event_loop::ServerCtx;
pub use server::{Server, ServerError};
