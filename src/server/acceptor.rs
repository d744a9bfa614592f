//! Accept loop.
//!
//! The listening socket is a std listener in non-blocking mode registered
//! with a mio `Poll` alongside a `Waker`, so shutdown can interrupt a
//! blocked accept without a connection arriving.

use super::connection::{self, ConnectionContext};
use crate::error::Error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub(super) const LISTENER: Token = Token(1);
pub(super) const WAKE: Token = Token(2);

const EVENTS_CAPACITY: usize = 64;

// Readiness is edge-triggered: after a hard accept error the backlog is
// retried on this timer.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What the accept loop does after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AcceptStep {
    /// The backlog is drained; wait for the next readiness event.
    Drained,
    /// Try again immediately.
    Retry,
    /// Back off, then retry without waiting for a new event.
    Backoff,
}

pub(super) fn classify_accept_error(err: &io::Error) -> AcceptStep {
    match err.kind() {
        ErrorKind::WouldBlock => AcceptStep::Drained,
        ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
            AcceptStep::Retry
        }
        // Descriptor exhaustion and the like.
        _ => AcceptStep::Backoff,
    }
}

pub(super) struct Acceptor {
    pub(super) listener: TcpListener,
    pub(super) local_addr: SocketAddr,
    pub(super) poll: Poll,
    pub(super) ctx: ConnectionContext,
    pub(super) listener_closed: Sender<()>,
}

impl Acceptor {
    /// Registers the listener with `poll`. Called once at bind time.
    pub(super) fn register(poll: &Poll, listener: &TcpListener) -> Result<(), Error> {
        listener.set_nonblocking(true)?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        Ok(())
    }

    /// Accepts until shutdown is requested, then closes the listener.
    ///
    /// Only a failing `poll` ends the loop early; failures on individual
    /// connection attempts are logged and skipped.
    #[instrument(skip(self), fields(local_addr = %self.local_addr))]
    pub(super) fn run(mut self) -> Result<(), Error> {
        info!(transport = self.ctx.transport.kind(), "Accepting connections");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        let mut backing_off = false;
        let result = loop {
            if self.ctx.shutdown.is_requested() {
                break Ok(());
            }
            let timeout = backing_off.then_some(ACCEPT_RETRY_DELAY);
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "Poll failed");
                break Err(err.into());
            }

            let mut listener_ready = backing_off;
            for event in events.iter() {
                match event.token() {
                    LISTENER => listener_ready = true,
                    WAKE => {}
                    token => debug!(?token, "Ignoring unexpected token"),
                }
            }
            if listener_ready {
                backing_off = self.accept_pending() == AcceptStep::Backoff;
            }
        };

        self.close_listener();
        result
    }

    // Accepts until the backlog is drained or a hard error forces a backoff.
    fn accept_pending(&self) -> AcceptStep {
        loop {
            if self.ctx.shutdown.is_requested() {
                return AcceptStep::Drained;
            }
            let err = match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    self.spawn_connection(stream, peer_addr);
                    continue;
                }
                Err(err) => err,
            };
            match classify_accept_error(&err) {
                AcceptStep::Drained => return AcceptStep::Drained,
                AcceptStep::Retry => {
                    if err.kind() != ErrorKind::Interrupted {
                        warn!(?err, "Transient accept error");
                    }
                }
                AcceptStep::Backoff => {
                    error!(?err, "Error accepting connection, backing off");
                    return AcceptStep::Backoff;
                }
            }
        }
    }

    fn spawn_connection(&self, stream: std::net::TcpStream, peer_addr: SocketAddr) {
        // Accepted sockets may inherit non-blocking mode from the listener.
        if let Err(err) = stream.set_nonblocking(false) {
            warn!(?err, %peer_addr, "Failed to configure accepted socket");
            return;
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, %peer_addr, "Failed to set TCP_NODELAY");
        }

        debug!(%peer_addr, "Accepted connection");
        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("conn-{peer_addr}"))
            .spawn(move || connection::serve(ctx, stream, peer_addr));
        if let Err(err) = spawned {
            error!(?err, %peer_addr, "Failed to spawn connection thread");
        }
    }

    fn close_listener(self) {
        if let Err(err) = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.listener.as_raw_fd()))
        {
            debug!(?err, "Failed to deregister listener");
        }
        drop(self.listener);
        info!("Listener closed");
        let _ = self.listener_closed.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_errors_are_classified() {
        let step = |kind: ErrorKind| classify_accept_error(&io::Error::from(kind));
        assert_eq!(step(ErrorKind::WouldBlock), AcceptStep::Drained);
        assert_eq!(step(ErrorKind::Interrupted), AcceptStep::Retry);
        assert_eq!(step(ErrorKind::ConnectionAborted), AcceptStep::Retry);
        assert_eq!(step(ErrorKind::ConnectionReset), AcceptStep::Retry);
    }

    #[test]
    fn descriptor_exhaustion_backs_off() {
        // EMFILE
        let err = io::Error::from_raw_os_error(24);
        assert_eq!(classify_accept_error(&err), AcceptStep::Backoff);
        assert_eq!(
            classify_accept_error(&io::Error::other("out of memory")),
            AcceptStep::Backoff
        );
    }
}
