//! The relay server: listener, per-connection threads and shutdown.
//!
//! Each accepted connection gets its own thread that runs the handshake, reads
//! the declared name and then becomes the session's Receive Loop. A second
//! thread per session drains its outbound queue (the Send Loop).

mod acceptor;
mod connection;
mod shutdown;

pub use shutdown::{spawn_signal_listener, ShutdownHandle};

use crate::config::ServerSettings;
use crate::error::Error;
use crate::router::Router;
use crate::session::Registry;
use crate::store::MessageStore;
use crate::transport::Transport;
use acceptor::{Acceptor, WAKE};
use connection::ConnectionContext;
use mio::{Poll, Waker};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::{mpsc, Arc};
use tracing::info;

/// A bound, not yet running relay server.
pub struct Server {
    acceptor: Acceptor,
    registry: Arc<Registry>,
}

impl Server {
    /// Loads the transport and binds the listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the TLS material cannot be loaded, the address does not
    /// resolve, or the bind itself fails. All of these are fatal at startup.
    pub fn bind(settings: ServerSettings, store: Arc<dyn MessageStore>) -> Result<Self, Error> {
        let transport = Arc::new(Transport::new(&settings)?);

        let addr = settings
            .bind
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(settings.bind.clone()))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(settings.bind.clone()))?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        Acceptor::register(&poll, &listener)?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let registry = Arc::new(Registry::new());
        let (closed_tx, closed_rx) = mpsc::channel();
        let shutdown = ShutdownHandle::new(waker, registry.clone(), closed_rx);

        info!(%local_addr, transport = transport.kind(), "Server bound");

        let ctx = ConnectionContext {
            transport,
            router: Router::new(registry.clone(), store),
            settings: Arc::new(settings),
            shutdown,
        };
        Ok(Self {
            acceptor: Acceptor {
                listener,
                local_addr,
                poll,
                ctx,
                listener_closed: closed_tx,
            },
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr
    }

    /// Handle that stops this server from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.acceptor.ctx.shutdown.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Runs the accept loop on the calling thread until shutdown.
    ///
    /// Returns once the listener is closed. Connection threads finish on their
    /// own after [`ShutdownHandle::shutdown`] closes their sockets.
    pub fn run(self) -> Result<(), Error> {
        self.acceptor.run()
    }
}
