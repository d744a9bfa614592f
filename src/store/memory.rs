use super::{HistoryEntry, MessageStore, NewMessage};
use crate::error::StoreError;
use crate::protocol::HistoryScope;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    timestamp: SystemTime,
    sender: String,
    recipient: Option<String>,
    group: Option<String>,
    body: String,
}

#[derive(Debug, Default)]
struct Inner {
    users: Vec<String>,
    groups: HashMap<String, Vec<String>>,
    messages: Vec<StoredMessage>,
    next_seq: u64,
}

impl Inner {
    fn has_user(&self, name: &str) -> bool {
        self.users.iter().any(|u| u == name)
    }
}

/// Process-local [`MessageStore`].
///
/// Users and groups are seeded at startup; messages live until the process
/// exits. Direct messages to unregistered users and group messages to unknown
/// groups are refused, like a relational store with foreign keys would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from seeded users and `group -> members` entries.
    ///
    /// Group members are registered as users if they are not already.
    pub fn with_seed<U, G>(users: U, groups: G) -> Self
    where
        U: IntoIterator<Item = String>,
        G: IntoIterator<Item = (String, Vec<String>)>,
    {
        let store = Self::new();
        for user in users {
            store.register_user(&user);
        }
        for (group, members) in groups {
            for member in members {
                store.add_group_member(&group, &member);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a username; returns false if it already exists
    /// (case-insensitively).
    pub fn register_user(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let lower = name.to_lowercase();
        if inner.users.iter().any(|u| u.to_lowercase() == lower) {
            return false;
        }
        inner.users.push(name.to_string());
        true
    }

    /// Adds `member` to `group`, creating either as needed.
    pub fn add_group_member(&self, group: &str, member: &str) {
        self.register_user(member);
        let mut inner = self.lock();
        let members = inner.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

impl MessageStore for MemoryStore {
    fn resolve_group_members(&self, group: &str) -> Result<Vec<String>, StoreError> {
        self.lock()
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))
    }

    fn append_message(&self, msg: NewMessage<'_>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(recipient) = msg.recipient {
            if !inner.has_user(recipient) {
                return Err(StoreError::UnknownUser(recipient.to_string()));
            }
        }
        if let Some(group) = msg.group {
            if !inner.groups.contains_key(group) {
                return Err(StoreError::UnknownGroup(group.to_string()));
            }
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.messages.push(StoredMessage {
            seq,
            timestamp: SystemTime::now(),
            sender: msg.sender.to_string(),
            recipient: msg.recipient.map(str::to_string),
            group: msg.group.map(str::to_string),
            body: msg.body.to_string(),
        });
        debug!(seq, "Stored message");
        Ok(())
    }

    fn fetch_history(
        &self,
        requester: &str,
        scope: &HistoryScope,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.lock();
        let mut matching: Vec<&StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| match scope {
                HistoryScope::Public => m.recipient.is_none() && m.group.is_none(),
                HistoryScope::Group(group) => m.group.as_deref() == Some(group.as_str()),
                HistoryScope::User(peer) => {
                    let to = m.recipient.as_deref();
                    (m.sender == requester && to == Some(peer.as_str()))
                        || (m.sender == *peer && to == Some(requester))
                }
            })
            .collect();
        // Append order already matches; the sort keeps the timestamp contract
        // explicit even if the wall clock stepped backwards.
        matching.sort_by_key(|m| (m.timestamp, m.seq));

        Ok(matching
            .into_iter()
            .map(|m| HistoryEntry {
                sender: m.sender.clone(),
                body: m.body.clone(),
            })
            .collect())
    }

    fn list_all_usernames(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().users.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::with_seed(
            ["alice", "bob", "carol"].map(String::from),
            [("devs".to_string(), vec!["alice".to_string(), "bob".to_string()])],
        )
    }

    fn bodies(entries: &[HistoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.body.as_str()).collect()
    }

    #[test]
    fn public_history_is_oldest_first_and_excludes_addressed() {
        let store = store();
        store.append_message(NewMessage::public("alice", "one")).unwrap();
        store.append_message(NewMessage::direct("alice", "bob", "psst")).unwrap();
        store.append_message(NewMessage::public("bob", "two")).unwrap();
        store.append_message(NewMessage::group("bob", "devs", "build")).unwrap();
        store.append_message(NewMessage::public("carol", "three")).unwrap();

        let history = store.fetch_history("carol", &HistoryScope::Public).unwrap();
        assert_eq!(bodies(&history), vec!["one", "two", "three"]);
        assert_eq!(history[0].sender, "alice");
    }

    #[test]
    fn user_scope_covers_both_directions_only() {
        let store = store();
        store.append_message(NewMessage::direct("alice", "bob", "a->b")).unwrap();
        store.append_message(NewMessage::direct("bob", "alice", "b->a")).unwrap();
        store.append_message(NewMessage::direct("carol", "bob", "c->b")).unwrap();

        let history = store
            .fetch_history("alice", &HistoryScope::User("bob".into()))
            .unwrap();
        assert_eq!(bodies(&history), vec!["a->b", "b->a"]);
    }

    #[test]
    fn group_scope_filters_by_group() {
        let store = store();
        store.add_group_member("ops", "carol");
        store.append_message(NewMessage::group("alice", "devs", "d1")).unwrap();
        store.append_message(NewMessage::group("carol", "ops", "o1")).unwrap();

        let history = store
            .fetch_history("bob", &HistoryScope::Group("devs".into()))
            .unwrap();
        assert_eq!(bodies(&history), vec!["d1"]);
    }

    #[test]
    fn refuses_unknown_recipient_and_group() {
        let store = store();
        assert_eq!(
            store.append_message(NewMessage::direct("alice", "zed", "x")),
            Err(StoreError::UnknownUser("zed".into()))
        );
        assert_eq!(
            store.append_message(NewMessage::group("alice", "nope", "x")),
            Err(StoreError::UnknownGroup("nope".into()))
        );
        assert_eq!(store.message_count(), 0);
    }

    #[test]
    fn registration_is_case_insensitive() {
        let store = store();
        assert!(!store.register_user("ALICE"));
        assert!(store.register_user("dave"));
        assert_eq!(
            store.list_all_usernames().unwrap(),
            vec!["alice", "bob", "carol", "dave"]
        );
    }

    #[test]
    fn resolves_group_members() {
        let store = store();
        assert_eq!(store.resolve_group_members("devs").unwrap(), vec!["alice", "bob"]);
        assert!(matches!(
            store.resolve_group_members("ghosts"),
            Err(StoreError::UnknownGroup(_))
        ));
    }
}
