use super::{Outbound, PushOutcome, Session, SessionId};
use crate::protocol::ServerMessage;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Concurrent map from session identity to live session state.
///
/// One mutex guards the whole map. Every enqueue is non-blocking, so deliveries
/// and roster broadcasts happen while the lock is held: a membership change and
/// the roster it produces are observed atomically by every session.
///
/// Sessions are kept in admission order (ids are allocated monotonically).
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands out a fresh identity for a connection about to be admitted.
    pub fn allocate_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // ============================================================================
    // Membership
    // ============================================================================

    /// Inserts a session and broadcasts the new roster to every live session.
    pub fn admit(&self, id: SessionId, session: Session) {
        let mut sessions = self.lock();
        info!(session = %id, name = session.name(), "Admitting session");
        if sessions.insert(id, session).is_some() {
            warn!(session = %id, "Session id admitted twice; replaced previous entry");
        }
        broadcast_roster(&sessions);
    }

    /// Removes a session and, if it was present, broadcasts the roster to the
    /// remaining sessions.
    ///
    /// Idempotent: later calls for the same id return `None` and broadcast
    /// nothing.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.lock();
        let removed = sessions.remove(&id)?;
        info!(session = %id, name = removed.name(), "Removed session");
        broadcast_roster(&sessions);
        Some(removed)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn name_of(&self, id: SessionId) -> Option<String> {
        self.lock().get(&id).map(|s| s.name.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// De-duplicated live names, see [`roster_names`].
    pub fn roster(&self) -> Vec<String> {
        roster_names(&self.lock())
    }

    // ============================================================================
    // Delivery
    // ============================================================================

    /// Enqueues `msg` to every session accepted by `pred`; returns how many.
    pub fn send_matching<F>(&self, pred: F, msg: &ServerMessage) -> usize
    where
        F: Fn(SessionId, &str) -> bool,
    {
        let encoded: Outbound = Arc::from(msg.encode());
        let sessions = self.lock();
        let mut delivered = 0;
        for (&id, session) in sessions.iter() {
            if pred(id, &session.name) {
                enqueue(id, session, &encoded);
                delivered += 1;
            }
        }
        delivered
    }

    /// Enqueues to one session; false if it is no longer live.
    pub fn send_to(&self, id: SessionId, msg: &ServerMessage) -> bool {
        self.send_matching(|sid, _| sid == id, msg) > 0
    }

    /// Enqueues to every session bound to exactly `name`.
    pub fn send_to_name(&self, name: &str, msg: &ServerMessage) -> usize {
        self.send_matching(|_, n| n == name, msg)
    }

    /// Enqueues to every session whose name is in `names`.
    pub fn send_to_names(&self, names: &HashSet<String>, msg: &ServerMessage) -> usize {
        self.send_matching(|_, n| names.contains(n), msg)
    }

    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        self.send_matching(|_, _| true, msg)
    }

    // ============================================================================
    // Shutdown
    // ============================================================================

    /// Closes every live connection without touching the map.
    ///
    /// Each connection's own loops observe the close and run their usual
    /// cleanup, which removes the entry.
    pub fn close_all(&self) -> usize {
        let channels: Vec<_> = self
            .lock()
            .iter()
            .map(|(&id, s)| (id, s.channel.clone()))
            .collect();
        for (id, channel) in &channels {
            debug!(session = %id, peer_addr = %channel.peer_addr(), "Closing connection");
            channel.close();
        }
        channels.len()
    }
}

fn enqueue(id: SessionId, session: &Session, msg: &Outbound) {
    match session.queue.push(msg.clone()) {
        PushOutcome::Queued => {}
        PushOutcome::DroppedOldest => {
            warn!(session = %id, name = session.name(), "Outbound queue full, dropped oldest message");
        }
        PushOutcome::Overflow => {
            warn!(session = %id, name = session.name(), "Outbound queue full, disconnecting session");
            session.channel.close();
        }
    }
}

/// Live names de-duplicated case-insensitively, keeping the spelling and
/// position of the first admitted session for each name.
pub(crate) fn roster_names(sessions: &BTreeMap<SessionId, Session>) -> Vec<String> {
    let mut seen = HashSet::new();
    sessions
        .values()
        .filter(|s| seen.insert(s.name.to_lowercase()))
        .map(|s| s.name.clone())
        .collect()
}

fn broadcast_roster(sessions: &BTreeMap<SessionId, Session>) {
    let roster = ServerMessage::ClientList(roster_names(sessions));
    let encoded: Outbound = Arc::from(roster.encode());
    debug!(sessions = sessions.len(), "Broadcasting roster");
    for (&id, session) in sessions.iter() {
        enqueue(id, session, &encoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{OutboundQueue, OverflowPolicy};
    use crate::transport::testing::MockChannel;
    use std::time::Duration;

    fn admit(registry: &Registry, name: &str) -> (SessionId, Arc<OutboundQueue>, Arc<MockChannel>) {
        let id = registry.allocate_id();
        let queue = Arc::new(OutboundQueue::unbounded());
        let channel = Arc::new(MockChannel::new());
        registry.admit(id, Session::new(name.to_string(), queue.clone(), channel.clone()));
        (id, queue, channel)
    }

    fn drained(queue: &OutboundQueue) -> Vec<String> {
        queue.drain().iter().map(|m| m.to_string()).collect()
    }

    fn last_roster(queue: &OutboundQueue) -> Option<String> {
        drained(queue)
            .into_iter()
            .filter(|m| m.starts_with("CLIENT_LIST:"))
            .last()
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn admission_broadcasts_roster_to_everyone() {
        let registry = Registry::new();
        let (_, alice_q, _) = admit(&registry, "alice");
        assert_eq!(drained(&alice_q), vec!["CLIENT_LIST:alice\n"]);

        let (_, bob_q, _) = admit(&registry, "bob");
        assert_eq!(drained(&alice_q), vec!["CLIENT_LIST:alice,bob\n"]);
        assert_eq!(drained(&bob_q), vec!["CLIENT_LIST:alice,bob\n"]);
    }

    #[test]
    fn roster_deduplicates_case_insensitively() {
        let registry = Registry::new();
        admit(&registry, "Alice");
        admit(&registry, "bob");
        admit(&registry, "alice");
        assert_eq!(registry.roster(), vec!["Alice", "bob"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn roster_after_connects_and_disconnects() {
        let registry = Registry::new();
        let names = ["ann", "ben", "cat", "dan", "eve"];
        let sessions: Vec<_> = names.iter().map(|n| admit(&registry, n)).collect();

        // Disconnect the first two.
        for (id, _, _) in &sessions[..2] {
            assert!(registry.remove(*id).is_some());
        }

        for (_, queue, _) in &sessions[2..] {
            assert_eq!(last_roster(queue).as_deref(), Some("CLIENT_LIST:cat,dan,eve\n"));
        }
        assert_eq!(registry.roster(), vec!["cat", "dan", "eve"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let (alice, _, _) = admit(&registry, "alice");
        let (_, bob_q, _) = admit(&registry, "bob");
        bob_q.drain();

        assert!(registry.remove(alice).is_some());
        assert!(registry.remove(alice).is_none());

        // Exactly one roster update for the single removal.
        assert_eq!(drained(&bob_q), vec!["CLIENT_LIST:bob\n"]);
        assert!(!registry.contains(alice));
    }

    #[test]
    fn concurrent_removal_broadcasts_once() {
        let registry = Arc::new(Registry::new());
        let (alice, _, _) = admit(&registry, "alice");
        let (_, bob_q, _) = admit(&registry, "bob");
        bob_q.drain();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.remove(alice).is_some())
            })
            .collect();
        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&r| r)
            .count();

        assert_eq!(removed, 1);
        assert_eq!(drained(&bob_q).len(), 1);
    }

    #[test]
    fn send_to_name_uses_exact_match() {
        let registry = Registry::new();
        let (_, alice_q, _) = admit(&registry, "alice");
        let (_, upper_q, _) = admit(&registry, "Alice");
        alice_q.drain();
        upper_q.drain();

        let msg = ServerMessage::Private {
            sender: "bob".into(),
            body: "hi".into(),
        };
        assert_eq!(registry.send_to_name("alice", &msg), 1);
        assert_eq!(drained(&alice_q), vec!["PRIVATE:bob:hi\n"]);
        assert!(upper_q.is_empty());
        assert_eq!(registry.send_to_name("nobody", &msg), 0);
    }

    #[test]
    fn overflow_disconnects_with_disconnect_policy() {
        let registry = Registry::new();
        let id = registry.allocate_id();
        let queue = Arc::new(OutboundQueue::new(1, OverflowPolicy::Disconnect));
        let channel = Arc::new(MockChannel::new());
        // The admission roster fills the queue.
        registry.admit(id, Session::new("slow".into(), queue.clone(), channel.clone()));
        assert!(!channel.is_closed());

        registry.broadcast(&ServerMessage::ClientList(vec![]));
        assert!(channel.is_closed());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn close_all_closes_channels_but_keeps_entries() {
        let registry = Registry::new();
        let (_, _, a) = admit(&registry, "alice");
        let (_, _, b) = admit(&registry, "bob");

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn queued_messages_survive_until_popped() {
        let registry = Registry::new();
        let (id, queue, _) = admit(&registry, "alice");
        queue.drain();
        registry.send_to(id, &ServerMessage::AllUsers(vec!["bob".into()]));
        let next = queue.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(&*next, "ALL_USERS:bob\n");
    }
}
