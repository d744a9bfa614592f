//! Message routing.
//!
//! The [`Router`] turns a decoded [`ClientCommand`] into deliveries on the
//! affected sessions' outbound queues, then records it with the
//! [`MessageStore`]. Delivery never waits on storage: a store failure is
//! logged and the message has already been routed.

use crate::protocol::{ClientCommand, HistoryScope, ServerMessage};
use crate::session::{Registry, SessionId};
use crate::store::{MessageStore, NewMessage};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, instrument, trace};

#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    store: Arc<dyn MessageStore>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Routes one command from session `from`.
    ///
    /// The sender is always the name `from` is registered under; commands
    /// from sessions that are no longer live are dropped.
    #[instrument(skip(self, cmd), fields(session = %from))]
    pub fn dispatch(&self, from: SessionId, cmd: ClientCommand) {
        let Some(sender) = self.registry.name_of(from) else {
            debug!("Dropping command from a session that is no longer registered");
            return;
        };

        match cmd {
            ClientCommand::History(scope) => self.send_history(from, &sender, &scope),
            ClientCommand::Public { body } => self.route_public(&sender, &body),
            ClientCommand::Direct { recipient, body } => {
                self.route_direct(from, &sender, &recipient, &body)
            }
            ClientCommand::Group { group, body } => self.route_group(&sender, &group, &body),
            ClientCommand::Disconnect => {
                debug!("Disconnect is handled by the receive loop");
            }
        }
    }

    /// Sends a newly admitted session its peer list and the public and
    /// self-scoped history.
    pub fn welcome(&self, id: SessionId, name: &str) {
        match self.store.list_all_usernames() {
            Ok(users) => {
                let others = users.into_iter().filter(|u| u != name).collect();
                self.registry.send_to(id, &ServerMessage::AllUsers(others));
            }
            Err(err) => error!(session = %id, ?err, "Failed to list users"),
        }
        self.send_history(id, name, &HistoryScope::Public);
        self.send_history(id, name, &HistoryScope::User(name.to_string()));
    }

    fn send_history(&self, to: SessionId, requester: &str, scope: &HistoryScope) {
        let entries = match self.store.fetch_history(requester, scope) {
            Ok(entries) => entries,
            Err(err) => {
                error!(session = %to, %scope, ?err, "Failed to fetch history");
                return;
            }
        };
        debug!(session = %to, %scope, count = entries.len(), "Replaying history");
        for entry in entries {
            let own = entry.sender == requester;
            let msg = ServerMessage::History {
                sender: entry.sender,
                body: entry.body,
                own,
            };
            if !self.registry.send_to(to, &msg) {
                // Requester went away mid-replay.
                return;
            }
        }
    }

    fn route_public(&self, sender: &str, body: &str) {
        let delivered = self.registry.broadcast(&ServerMessage::Public {
            sender: sender.to_string(),
            body: body.to_string(),
        });
        trace!(sender, delivered, "Routed public message");
        self.persist(NewMessage::public(sender, body));
    }

    fn route_direct(&self, from: SessionId, sender: &str, recipient: &str, body: &str) {
        let msg = ServerMessage::Private {
            sender: sender.to_string(),
            body: body.to_string(),
        };
        // The sender's own session gets an echo; a self-addressed message is
        // still enqueued only once per session.
        let delivered = self
            .registry
            .send_matching(|id, name| id == from || name == recipient, &msg);
        trace!(sender, recipient, delivered, "Routed direct message");
        self.persist(NewMessage::direct(sender, recipient, body));
    }

    fn route_group(&self, sender: &str, group: &str, body: &str) {
        match self.store.resolve_group_members(group) {
            Ok(members) => {
                let members: HashSet<String> = members.into_iter().collect();
                let delivered = self.registry.send_to_names(
                    &members,
                    &ServerMessage::Group {
                        group: group.to_string(),
                        sender: sender.to_string(),
                        body: body.to_string(),
                    },
                );
                trace!(sender, group, delivered, "Routed group message");
            }
            Err(err) => error!(sender, group, ?err, "Failed to resolve group members"),
        }
        self.persist(NewMessage::group(sender, group, body));
    }

    fn persist(&self, msg: NewMessage<'_>) {
        if let Err(err) = self.store.append_message(msg) {
            error!(sender = msg.sender, ?err, "Failed to store message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::session::{OutboundQueue, Session};
    use crate::store::{HistoryEntry, MemoryStore};
    use crate::transport::testing::MockChannel;

    struct Harness {
        router: Router,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::with_seed(
                ["alice", "bob", "carol", "dave"].map(String::from),
                [(
                    "devs".to_string(),
                    vec!["alice".to_string(), "bob".to_string(), "dave".to_string()],
                )],
            ));
            Self {
                router: Router::new(Arc::new(Registry::new()), store.clone()),
                store,
            }
        }

        fn connect(&self, name: &str) -> (SessionId, Arc<OutboundQueue>) {
            let registry = self.router.registry();
            let id = registry.allocate_id();
            let queue = Arc::new(OutboundQueue::unbounded());
            registry.admit(
                id,
                Session::new(name.to_string(), queue.clone(), Arc::new(MockChannel::new())),
            );
            (id, queue)
        }

        fn send(&self, from: SessionId, line: &str) {
            self.router.dispatch(from, ClientCommand::decode(line));
        }
    }

    // Everything queued except roster updates.
    fn messages(queue: &OutboundQueue) -> Vec<String> {
        queue
            .drain()
            .iter()
            .map(|m| m.to_string())
            .filter(|m| !m.starts_with("CLIENT_LIST:"))
            .collect()
    }

    struct FailingStore;

    impl MessageStore for FailingStore {
        fn resolve_group_members(&self, _group: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn append_message(&self, _msg: NewMessage<'_>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn fetch_history(
            &self,
            _requester: &str,
            _scope: &HistoryScope,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn list_all_usernames(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn public_messages_reach_everyone_in_order() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");

        h.send(alice, "first");
        h.send(alice, "@PUBLIC:second");

        let expected = vec!["PUBLIC:alice:first\n", "PUBLIC:alice:second\n"];
        assert_eq!(messages(&alice_q), expected);
        assert_eq!(messages(&bob_q), expected);
        assert_eq!(h.store.message_count(), 2);
    }

    #[test]
    fn direct_message_goes_to_sender_and_recipient_only() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");
        let (_, carol_q) = h.connect("carol");

        h.send(alice, "@bob:hi");

        assert_eq!(messages(&alice_q), vec!["PRIVATE:alice:hi\n"]);
        assert_eq!(messages(&bob_q), vec!["PRIVATE:alice:hi\n"]);
        assert!(messages(&carol_q).is_empty());
    }

    #[test]
    fn direct_message_to_offline_user_is_echoed_and_persisted() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");

        h.send(alice, "@dave:later");

        assert_eq!(messages(&alice_q), vec!["PRIVATE:alice:later\n"]);
        let history = h
            .store
            .fetch_history("dave", &HistoryScope::User("alice".into()))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "later");
    }

    #[test]
    fn direct_addressing_is_case_sensitive() {
        let h = Harness::new();
        let (alice, _) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");

        h.send(alice, "@Bob:hi");
        assert!(messages(&bob_q).is_empty());
    }

    #[test]
    fn self_addressed_direct_is_enqueued_once() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");

        h.send(alice, "@alice:note to self");
        assert_eq!(messages(&alice_q), vec!["PRIVATE:alice:note to self\n"]);
    }

    #[test]
    fn group_message_reaches_live_members_only() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");
        let (_, carol_q) = h.connect("carol");

        h.send(alice, "GROUP:devs:deploy");

        assert_eq!(messages(&alice_q), vec!["GROUP:devs:alice:deploy\n"]);
        assert_eq!(messages(&bob_q), vec!["GROUP:devs:alice:deploy\n"]);
        assert!(messages(&carol_q).is_empty());
        assert_eq!(h.store.message_count(), 1);
    }

    #[test]
    fn non_member_sender_does_not_get_group_echo() {
        let h = Harness::new();
        let (carol, carol_q) = h.connect("carol");
        let (_, bob_q) = h.connect("bob");

        h.send(carol, "GROUP:devs:hello");
        assert!(messages(&carol_q).is_empty());
        assert_eq!(messages(&bob_q), vec!["GROUP:devs:carol:hello\n"]);
    }

    #[test]
    fn history_is_delivered_to_requester_only_with_me_tag() {
        let h = Harness::new();
        let (alice, alice_q) = h.connect("alice");
        let (bob, bob_q) = h.connect("bob");

        h.send(alice, "one");
        h.send(bob, "two");
        h.send(alice, "three");
        messages(&alice_q);
        messages(&bob_q);

        h.send(alice, "HISTORY:public");

        assert_eq!(
            messages(&alice_q),
            vec!["HISTORY:ME:one\n", "HISTORY:bob:two\n", "HISTORY:ME:three\n"]
        );
        assert!(messages(&bob_q).is_empty());
        // History requests are not stored.
        assert_eq!(h.store.message_count(), 3);
    }

    #[test]
    fn welcome_sends_peers_and_history() {
        let h = Harness::new();
        let (bob, _) = h.connect("bob");
        h.send(bob, "earlier");

        let (alice, alice_q) = h.connect("alice");
        h.router.welcome(alice, "alice");

        assert_eq!(
            messages(&alice_q),
            vec!["ALL_USERS:bob,carol,dave\n", "HISTORY:bob:earlier\n"]
        );
    }

    #[test]
    fn sender_name_comes_from_registry() {
        let h = Harness::new();
        let (alice, _) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");

        // A body that looks like a server-side attribution is still alice's.
        h.send(alice, "PUBLIC:mallory:hi");
        assert_eq!(messages(&bob_q), vec!["PUBLIC:alice:PUBLIC:mallory:hi\n"]);
    }

    #[test]
    fn commands_from_removed_sessions_are_dropped() {
        let h = Harness::new();
        let (alice, _) = h.connect("alice");
        let (_, bob_q) = h.connect("bob");
        h.router.registry().remove(alice);
        messages(&bob_q);

        h.send(alice, "ghost");
        assert!(messages(&bob_q).is_empty());
        assert_eq!(h.store.message_count(), 0);
    }

    #[test]
    fn store_failures_do_not_block_delivery() {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry.clone(), Arc::new(FailingStore));
        let id = registry.allocate_id();
        let queue = Arc::new(OutboundQueue::unbounded());
        registry.admit(
            id,
            Session::new("alice".into(), queue.clone(), Arc::new(MockChannel::new())),
        );

        router.welcome(id, "alice");
        router.dispatch(id, ClientCommand::decode("still here"));
        router.dispatch(id, ClientCommand::decode("@alice:me too"));

        assert_eq!(
            messages(&queue),
            vec!["PUBLIC:alice:still here\n", "PRIVATE:alice:me too\n"]
        );
    }
}
