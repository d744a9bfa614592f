//! Plaintext TCP transport.
//!
//! Meant for local development and tests; production deployments use TLS.

use super::{Channel, TransportImpl};
use crate::error::Error;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub(super) struct TcpTransport;

impl TransportImpl for TcpTransport {
    fn establish(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        _timeout: Duration,
    ) -> Result<Arc<dyn Channel>, Error> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!(%peer_addr, "TCP connection established");
        Ok(Arc::new(TcpChannel {
            reader: stream,
            writer: Mutex::new(writer),
            peer_addr,
            closed: AtomicBool::new(false),
        }))
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

pub(super) struct TcpChannel {
    reader: TcpStream,
    writer: Mutex<TcpStream>,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

impl Channel for TcpChannel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.reader).read(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data)?;
        writer.flush()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer_addr = &self.peer_addr;
        match self.reader.shutdown(Shutdown::Both) {
            Ok(()) => debug!(%peer_addr, "Shut down connection"),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
            Err(err) => warn!(%peer_addr, ?err, "Error shutting down connection"),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.set_read_timeout(timeout)
    }
}
