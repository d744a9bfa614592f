//! Per-connection handling: handshake, name declaration, and the
//! Receive/Send loop pair.

use super::ShutdownHandle;
use crate::config::ServerSettings;
use crate::error::Error;
use crate::protocol::{ClientCommand, LineDecoder};
use crate::router::Router;
use crate::session::{OutboundQueue, Registry, Session, SessionId};
use crate::transport::{is_timeout, Channel, Transport};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const RECV_BUF_SIZE: usize = 8 * 1024;

/// Everything a connection thread needs, shared by all connections.
#[derive(Clone)]
pub(super) struct ConnectionContext {
    pub(super) transport: Arc<Transport>,
    pub(super) router: Router,
    pub(super) settings: Arc<ServerSettings>,
    pub(super) shutdown: ShutdownHandle,
}

/// Runs one accepted connection to completion on the calling thread.
///
/// Handshake and name failures are logged and drop the socket; they never
/// reach the acceptor.
#[instrument(skip(ctx, stream))]
pub(super) fn serve(ctx: ConnectionContext, stream: TcpStream, peer_addr: SocketAddr) {
    let channel = match ctx.transport.establish(stream) {
        Ok(channel) => channel,
        Err(err @ Error::HandshakeTimeout { .. }) => {
            info!(?err, "Handshake timed out");
            return;
        }
        Err(err) if err.is_disconnect() => {
            info!(?err, "Client disconnected during handshake");
            return;
        }
        Err(err) => {
            warn!(?err, "Handshake failed");
            return;
        }
    };

    let mut decoder = LineDecoder::new(ctx.settings.max_message_size);
    let (name, early_lines) =
        match read_name(&*channel, &mut decoder, ctx.settings.handshake_timeout) {
            Ok(Some(declared)) => declared,
            Ok(None) => {
                debug!("Connection closed before a name was declared");
                channel.close();
                return;
            }
            Err(err @ (Error::EmptyName | Error::HandshakeTimeout { .. })) => {
                info!(?err, "Client did not declare a name");
                channel.close();
                return;
            }
            Err(err) => {
                warn!(?err, "Failed to read client name");
                channel.close();
                return;
            }
        };

    let registry = ctx.router.registry().clone();
    let id = registry.allocate_id();
    let queue = Arc::new(OutboundQueue::new(
        ctx.settings.outbound_queue_capacity,
        ctx.settings.overflow_policy,
    ));
    registry.admit(id, Session::new(name.clone(), queue.clone(), channel.clone()));

    // A shutdown that started before admission would have missed this session.
    if ctx.shutdown.is_requested() {
        registry.remove(id);
        channel.close();
        return;
    }
    info!(session = %id, name, "Client connected");

    ctx.router.welcome(id, &name);

    let sender = {
        let registry = registry.clone();
        let channel = channel.clone();
        let interval = ctx.settings.send_poll_interval;
        thread::Builder::new()
            .name(format!("send-{}", id.as_u64()))
            .spawn(move || send_loop(&registry, id, &queue, &*channel, interval))
    };
    let sender = match sender {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!(session = %id, ?err, "Failed to spawn send loop");
            registry.remove(id);
            channel.close();
            return;
        }
    };

    match receive_loop(&ctx.router, id, &*channel, &mut decoder, early_lines) {
        Ok(()) => {}
        Err(err) if err.is_disconnect() => debug!(session = %id, ?err, "Connection lost"),
        Err(err) => warn!(session = %id, ?err, "Receive loop failed"),
    }

    // Either loop, or shutdown, may get here first; removal is idempotent.
    registry.remove(id);
    channel.close();
    info!(session = %id, name, "Client disconnected");

    if let Some(handle) = sender {
        if handle.join().is_err() {
            error!(session = %id, "Send loop panicked");
        }
    }
}

/// Reads until the first complete line, which is the client's declared name.
///
/// Returns `Ok(None)` if the peer closes first. Lines that arrived in the
/// same reads as the name are returned so they are not lost.
pub(super) fn read_name(
    channel: &dyn Channel,
    decoder: &mut LineDecoder,
    timeout: Duration,
) -> Result<Option<(String, Vec<String>)>, Error> {
    let timeout_ms = timeout.as_millis() as u64;
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; RECV_BUF_SIZE];

    let declared = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::HandshakeTimeout { timeout_ms });
        }
        channel.set_read_timeout(Some(remaining))?;

        let n = match channel.recv(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(err) if is_timeout(&err) => return Err(Error::HandshakeTimeout { timeout_ms }),
            Err(err) => return Err(err.into()),
        };
        let mut lines = decoder.push(&buf[..n])?;
        if !lines.is_empty() {
            let first = lines.remove(0);
            break (first, lines);
        }
    };
    channel.set_read_timeout(None)?;

    let (first, rest) = declared;
    let name = first.trim();
    if name.is_empty() {
        return Err(Error::EmptyName);
    }
    Ok(Some((name.to_string(), rest)))
}

/// Reads framed messages and hands each to the router until the peer closes,
/// logs out, or the connection fails.
pub(super) fn receive_loop(
    router: &Router,
    id: SessionId,
    channel: &dyn Channel,
    decoder: &mut LineDecoder,
    early_lines: Vec<String>,
) -> Result<(), Error> {
    let dispatch = |line: &str| match ClientCommand::decode(line) {
        _ if line.is_empty() => true,
        ClientCommand::Disconnect => {
            info!(session = %id, "Client logged out");
            false
        }
        cmd => {
            trace!(session = %id, ?cmd, "Dispatching");
            router.dispatch(id, cmd);
            true
        }
    };

    for line in &early_lines {
        if !dispatch(line.as_str()) {
            return Ok(());
        }
    }

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let n = channel.recv(&mut buf)?;
        if n == 0 {
            debug!(session = %id, "Peer closed connection");
            return Ok(());
        }
        for line in decoder.push(&buf[..n])? {
            if !dispatch(line.as_str()) {
                return Ok(());
            }
        }
    }
}

/// Drains the session's queue onto the connection.
///
/// Runs while the session is registered; the bounded wait lets it notice
/// removal promptly. A failed write closes the connection so the Receive Loop
/// performs the cleanup.
pub(super) fn send_loop(
    registry: &Registry,
    id: SessionId,
    queue: &OutboundQueue,
    channel: &dyn Channel,
    poll_interval: Duration,
) {
    while registry.contains(id) {
        let Some(msg) = queue.pop_timeout(poll_interval) else {
            continue;
        };
        if let Err(err) = channel.send(msg.as_bytes()) {
            debug!(session = %id, ?err, "Write failed, closing connection");
            channel.close();
            break;
        }
    }
    debug!(session = %id, "Send loop finished");
}
