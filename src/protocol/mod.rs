//! The line-oriented text protocol.
//!
//! Every message in either direction is one UTF-8 line terminated by `\n`.
//! The first line a client sends is its display name; every later line is a
//! [`ClientCommand`]. The server answers with [`ServerMessage`] lines.

mod framing;
mod message;

pub use framing::LineDecoder;
pub use message::{ClientCommand, HistoryScope, ServerMessage, DISCONNECT, EVERYONE, HISTORY_SELF};
