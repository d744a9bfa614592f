use crate::error::Error;
use crate::session::Registry;
use mio::Waker;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

// How long shutdown waits for the acceptor to confirm the listener is closed.
const LISTENER_CLOSE_WAIT: Duration = Duration::from_secs(2);

struct ShutdownState {
    requested: AtomicBool,
    waker: Waker,
    registry: Arc<Registry>,
    listener_closed: Mutex<Option<Receiver<()>>>,
}

/// Cloneable trigger for an orderly server shutdown.
///
/// Shutdown first stops the acceptor (which closes the listening socket), then
/// closes every live connection in the registry. It never edits the registry
/// itself: each closed connection's loops observe the close and run their
/// normal cleanup.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    pub(super) fn new(
        waker: Waker,
        registry: Arc<Registry>,
        listener_closed: Receiver<()>,
    ) -> Self {
        Self {
            state: Arc::new(ShutdownState {
                requested: AtomicBool::new(false),
                waker,
                registry,
                listener_closed: Mutex::new(Some(listener_closed)),
            }),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every live connection. Idempotent; only
    /// the first call does any work.
    pub fn shutdown(&self) {
        if self.state.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down server");

        if let Err(err) = self.state.waker.wake() {
            warn!(?err, "Failed to wake acceptor");
        }

        let listener_closed = self
            .state
            .listener_closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = listener_closed {
            match rx.recv_timeout(LISTENER_CLOSE_WAIT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Acceptor did not confirm listener close in time")
                }
            }
        }

        let closed = self.state.registry.close_all();
        info!(closed, "Closed live connections");
    }
}

/// Spawns a thread that triggers `handle` on SIGINT or SIGTERM.
///
/// The thread exits once shutdown has completed, so joining it waits for
/// the shutdown sequence.
pub fn spawn_signal_listener(handle: ShutdownHandle) -> Result<JoinHandle<()>, Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let thread = thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received termination signal");
                handle.shutdown();
            }
        })?;
    Ok(thread)
}
