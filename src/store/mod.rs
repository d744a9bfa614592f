//! Persistence collaborator consumed by the router.
//!
//! Credential handling and durable storage live behind [`MessageStore`]; the
//! relay core only needs group resolution, message appends, history reads and
//! the list of registered names.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::protocol::HistoryScope;

/// One message as the router hands it to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewMessage<'a> {
    pub sender: &'a str,
    /// Set for direct messages.
    pub recipient: Option<&'a str>,
    /// Set for group messages.
    pub group: Option<&'a str>,
    pub body: &'a str,
}

impl<'a> NewMessage<'a> {
    pub fn public(sender: &'a str, body: &'a str) -> Self {
        Self {
            sender,
            recipient: None,
            group: None,
            body,
        }
    }

    pub fn direct(sender: &'a str, recipient: &'a str, body: &'a str) -> Self {
        Self {
            sender,
            recipient: Some(recipient),
            group: None,
            body,
        }
    }

    pub fn group(sender: &'a str, group: &'a str, body: &'a str) -> Self {
        Self {
            sender,
            recipient: None,
            group: Some(group),
            body,
        }
    }
}

/// One replayed history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub body: String,
}

/// Storage operations the relay needs.
///
/// Implementations must be callable concurrently from every connection thread.
pub trait MessageStore: Send + Sync {
    /// Names of every member of `group`.
    fn resolve_group_members(&self, group: &str) -> Result<Vec<String>, StoreError>;

    /// Records a routed message.
    fn append_message(&self, msg: NewMessage<'_>) -> Result<(), StoreError>;

    /// Messages visible to `requester` in `scope`, oldest first.
    fn fetch_history(
        &self,
        requester: &str,
        scope: &HistoryScope,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Every registered username.
    fn list_all_usernames(&self) -> Result<Vec<String>, StoreError>;
}
