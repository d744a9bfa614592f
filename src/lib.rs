//! RelayChat - a multi-client chat relay over TLS
//!
//! Clients connect over TLS (or plaintext TCP for local testing), declare a
//! display name on the first line, and then exchange newline-delimited text
//! commands. The server keeps a live session registry, routes public, direct
//! and group messages, replays history from a pluggable [`MessageStore`], and
//! broadcasts the roster to every client whenever it changes.
//!
//! ```no_run
//! use relaychat::prelude::*;
//! use std::sync::Arc;
//!
//! let settings = ServerSettings {
//!     transport_type: "tcp".into(),
//!     ..ServerSettings::default()
//! };
//! let server = Server::bind(settings, Arc::new(MemoryStore::new()))?;
//! server.run()?;
//! # Ok::<(), relaychat::Error>(())
//! ```

pub mod config;
pub(crate) mod error;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;

pub use config::ServerSettings;
pub use error::{Error, StoreError};
pub use protocol::{ClientCommand, HistoryScope, LineDecoder, ServerMessage};
pub use router::Router;
pub use server::{spawn_signal_listener, Server, ShutdownHandle};
pub use session::{OutboundQueue, OverflowPolicy, Registry, SessionId};
pub use store::{HistoryEntry, MemoryStore, MessageStore, NewMessage};
pub use transport::{load_tls_client_config, load_tls_server_config, Channel, Transport};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::ServerSettings;
    pub use crate::error::{Error, StoreError};
    pub use crate::protocol::{ClientCommand, ServerMessage};
    pub use crate::server::{Server, ShutdownHandle};
    pub use crate::store::{MemoryStore, MessageStore};
}
