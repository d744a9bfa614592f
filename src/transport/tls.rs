//! TLS transport implementation.
//!
//! Drives a `rustls::ServerConnection` by hand over a blocking socket. After
//! the handshake the socket is split into a read clone and a write clone so
//! the Receive Loop can block in `recv` while the Send Loop keeps writing.
//!
//! Lock order is always `writer` -> `tls`. The reader holds `pending` for the
//! whole of `recv` but never holds `tls` while blocked on the socket.

use super::{is_timeout, Channel, TransportImpl};
use crate::error::Error;
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

// Ciphertext read per socket call.
const READ_CHUNK: usize = 16 * 1024;

pub(super) struct TlsTransport {
    config: Arc<ServerConfig>,
}

impl TlsTransport {
    pub(super) fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl TransportImpl for TlsTransport {
    #[instrument(skip(self, stream, timeout))]
    fn establish(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<dyn Channel>, Error> {
        let timeout_ms = timeout.as_millis() as u64;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut tls = ServerConnection::new(self.config.clone())
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

        let started = Instant::now();
        while tls.is_handshaking() {
            if started.elapsed() >= timeout {
                return Err(Error::HandshakeTimeout { timeout_ms });
            }
            match tls.complete_io(&mut stream) {
                Ok(_) => {}
                Err(err) if is_timeout(&err) => return Err(Error::HandshakeTimeout { timeout_ms }),
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    return Err(Error::TlsHandshake(err.to_string()))
                }
                Err(err) => return Err(err.into()),
            }
        }
        // Session tickets and the like.
        while tls.wants_write() {
            tls.write_tls(&mut stream)?;
        }

        // Established streams are long-lived and may idle indefinitely.
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        tls.set_buffer_limit(None);

        info!(%peer_addr, "TLS handshake completed");

        let writer = stream.try_clone()?;
        Ok(Arc::new(TlsChannel {
            tls: Mutex::new(tls),
            pending: Mutex::new(Vec::new()),
            reader: stream,
            writer: Mutex::new(writer),
            peer_addr,
            closed: AtomicBool::new(false),
        }))
    }

    fn kind(&self) -> &'static str {
        "tls"
    }
}

pub(super) struct TlsChannel {
    tls: Mutex<ServerConnection>,
    // Ciphertext read from the socket but not yet accepted by rustls.
    pending: Mutex<Vec<u8>>,
    reader: TcpStream,
    writer: Mutex<TcpStream>,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn drain_tls(tls: &mut ServerConnection) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while tls.wants_write() {
        tls.write_tls(&mut out)?;
    }
    Ok(out)
}

impl TlsChannel {
    // Writes whatever records rustls has queued (alerts, key updates).
    fn flush_tls(&self) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let out = drain_tls(&mut lock(&self.tls))?;
        if !out.is_empty() {
            writer.write_all(&out)?;
        }
        Ok(())
    }
}

impl Channel for TlsChannel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = lock(&self.pending);
        loop {
            let mut flush = false;
            let mut processed = false;
            {
                let mut tls = lock(&self.tls);
                match tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }

                // No plaintext is buffered, so rustls has room for more input.
                if !pending.is_empty() {
                    let consumed = tls.read_tls(&mut &pending[..])?;
                    pending.drain(..consumed);
                    tls.process_new_packets()
                        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                    flush = tls.wants_write();
                    processed = consumed > 0;
                }
            }

            if flush {
                self.flush_tls()?;
            }

            // Newly decrypted plaintext is returned before touching the socket.
            if processed {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = (&self.reader).read(&mut chunk)?;
            if n == 0 {
                return Ok(0);
            }
            trace!(len = n, peer_addr = %self.peer_addr, "Read encrypted data from socket");
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let out = {
            let mut tls = lock(&self.tls);
            tls.writer().write_all(data)?;
            drain_tls(&mut tls)?
        };
        writer.write_all(&out)?;
        writer.flush()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer_addr = &self.peer_addr;
        match self.reader.shutdown(Shutdown::Both) {
            Ok(()) => debug!(%peer_addr, "Shut down connection"),
            Err(err) if err.kind() == ErrorKind::NotConnected => {}
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
