use thiserror::Error;

/// The error type for relaychat operations.
///
/// Covers startup (configuration, TLS material, binding) and per-connection
/// failures. Per-connection errors never escape the connection's own threads;
/// they are logged and turned into the normal disconnect path.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    // ============================================================================
    // Connection Setup Errors
    // ============================================================================

    /// The peer did not finish the handshake (or declare its name) in time.
    #[error("Handshake timed out after {timeout_ms} ms")]
    HandshakeTimeout { timeout_ms: u64 },

    /// The first line sent by the peer was empty after trimming.
    #[error("Client declared an empty name")]
    EmptyName,

    /// An inbound line grew beyond `max_message_size` without a delimiter.
    #[error("Inbound message exceeds {limit} bytes")]
    MessageTooLong { limit: usize },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// TLS handshake failed during connection establishment.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The TLS transport was selected but no certificate/key was configured.
    ///
    /// Set both `tls_server_cert` and `tls_server_key`.
    #[error("TLS server configuration not provided - tls_server_cert and tls_server_key are required")]
    TlsServerConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `transport_type` configuration key.
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },

    /// Invalid value for the `overflow_policy` configuration key.
    #[error("Invalid overflow policy '{0}', expected one of: drop_oldest, disconnect")]
    InvalidOverflowPolicy(String),
}

impl Error {
    /// Returns true if this error means the peer simply went away.
    pub(crate) fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

// ============================================================================
// Persistence Errors
// ============================================================================

/// Errors reported by a [`MessageStore`](crate::MessageStore).
///
/// The router never fails a delivery because of these; it logs them and keeps
/// routing. Durability is best effort and not transactional with delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The named user is not registered.
    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    /// The named group does not exist.
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    /// The backing storage could not be reached.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
