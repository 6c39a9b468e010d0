//! shoal echo server.
//!
//! Demo binary for the event-driven socket server core: every byte a
//! client sends is queued straight back to it. The process runs until
//! Enter is pressed on stdin, then stops the server synchronously.

use shoal::{CloseReason, Config, ConnectionHandler, ConnectionId, EnqueueError, Server, ServerCtx};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_connect(&mut self, ctx: &mut ServerCtx<'_>, id: ConnectionId) {
        debug!(conn_id = id, peer = ?ctx.peer_addr(id), "Client connected");
    }

    fn on_data(&mut self, ctx: &mut ServerCtx<'_>, id: ConnectionId, data: &[u8]) -> usize {
        match ctx.enqueue_write(id, data) {
            Ok(()) => data.len(),
            // Over the high-water mark: leave the bytes buffered and
            // retry once the peer has drained some of our output.
            Err(EnqueueError::WouldBlock) => 0,
            Err(EnqueueError::UnknownConnection(_)) => data.len(),
        }
    }

    fn on_close(&mut self, id: ConnectionId, reason: CloseReason) {
        debug!(conn_id = id, reason = ?reason, "Client disconnected");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let port = config.port;
    let mut server = Server::with_config(EchoHandler, config);
    server.start(port)?;

    if let Some(addr) = server.local_addr() {
        info!(%addr, "Echo server running, press Enter to stop");
    }

    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    server.stop()?;
    Ok(())
}
