//! Live client sessions.
//!
//! A session binds one established connection to the name its client declared.
//! The [`Registry`] is the single source of truth for which sessions are live;
//! each session's [`OutboundQueue`] decouples routing from socket writes.

mod queue;
mod registry;

pub use queue::{Outbound, OutboundQueue, OverflowPolicy, PushOutcome};
pub use registry::Registry;

use crate::transport::Channel;
use std::fmt;
use std::sync::Arc;

/// Opaque identity of one connection's session.
///
/// Allocated by [`Registry::allocate_id`]; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State the registry keeps for one live client.
pub struct Session {
    pub(crate) name: String,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) channel: Arc<dyn Channel>,
}

impl Session {
    pub fn new(name: String, queue: Arc<OutboundQueue>, channel: Arc<dyn Channel>) -> Self {
        Self {
            name,
            queue,
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("queued", &self.queue.len())
            .field("peer_addr", &self.channel.peer_addr())
            .finish()
    }
}
