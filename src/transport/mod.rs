//! Transport layer: turns an accepted socket into an established [`Channel`].
//!
//! The [`Transport`] struct selects between the TLS and plaintext TCP
//! implementations based on the `transport_type` setting.

mod tcp;
#[cfg(test)]
pub(crate) mod testing;
mod tls;
mod tls_config;

pub use tls_config::{load_tls_client_config, load_tls_server_config};

use crate::config::ServerSettings;
use crate::error::Error;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tcp::TcpTransport;
use tls::TlsTransport;

/// An established, bidirectional byte channel to one client.
///
/// Shared between exactly one reader (the Receive Loop) and any number of
/// writers. Closing is idempotent and unblocks a reader parked in
/// [`Channel::recv`].
pub trait Channel: Send + Sync {
    /// Reads decrypted bytes; `Ok(0)` means the peer closed its side.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Shuts the connection down in both directions.
    fn close(&self);

    fn peer_addr(&self) -> SocketAddr;

    /// Bounds how long [`Channel::recv`] may block; `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

// Internal transport trait.
//
// Note: This trait is internal. Users should use the `Transport` struct
// instead.
trait TransportImpl: Send + Sync {
    fn establish(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<dyn Channel>, Error>;

    fn kind(&self) -> &'static str;
}

/// Dynamic transport that wraps TLS or TCP based on configuration.
pub struct Transport {
    inner: Box<dyn TransportImpl>,
    handshake_timeout: Duration,
}

impl Transport {
    /// Creates the transport named by `settings.transport_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `transport_type` is neither "tls" nor "tcp"
    /// - TLS is selected and the certificate or key is missing or invalid
    pub fn new(settings: &ServerSettings) -> Result<Self, Error> {
        let inner: Box<dyn TransportImpl> = match settings.transport_type.as_str() {
            "tls" => {
                let (Some(cert), Some(key)) = (&settings.tls_server_cert, &settings.tls_server_key)
                else {
                    return Err(Error::TlsServerConfigMissing);
                };
                Box::new(TlsTransport::new(load_tls_server_config(cert, key)?))
            }
            "tcp" => Box::new(TcpTransport),
            other => {
                return Err(Error::InvalidTransportType {
                    got: other.to_string(),
                    valid: vec!["tls".to_string(), "tcp".to_string()],
                })
            }
        };

        Ok(Self {
            inner,
            handshake_timeout: settings.handshake_timeout,
        })
    }

    /// Runs the handshake on a freshly accepted socket.
    ///
    /// Blocks the calling thread for at most the handshake timeout. On failure
    /// the socket is dropped, which closes it.
    pub fn establish(&self, stream: TcpStream) -> Result<Arc<dyn Channel>, Error> {
        let peer_addr = stream.peer_addr()?;
        self.inner
            .establish(stream, peer_addr, self.handshake_timeout)
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind()
    }
}

/// True for the error kinds a socket timeout produces.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
