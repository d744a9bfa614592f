use crate::error::Error;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// An encoded wire message, shared between every queue it is delivered to.
pub type Outbound = Arc<str>;

/// What a full [`OutboundQueue`] does with a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest undelivered message to make room.
    DropOldest,
    /// Refuse the message; the owning session gets disconnected.
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(Error::InvalidOverflowPolicy(other.to_string())),
        }
    }
}

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message.
    DroppedOldest,
    /// Not queued; the queue is full and the policy is `Disconnect`.
    Overflow,
}

/// FIFO of encoded messages awaiting delivery to one client.
///
/// Many producers (any router invocation), one consumer (the session's Send
/// Loop). A capacity of zero means unbounded.
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    available: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity,
            policy,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0, OverflowPolicy::DropOldest)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        // The deque is never left half-updated, so a poisoned lock is still usable.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a message, applying the overflow policy when full.
    pub fn push(&self, msg: Outbound) -> PushOutcome {
        let mut items = self.lock();
        let mut outcome = PushOutcome::Queued;
        if self.capacity > 0 && items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    items.pop_front();
                    outcome = PushOutcome::DroppedOldest;
                }
                OverflowPolicy::Disconnect => return PushOutcome::Overflow,
            }
        }
        items.push_back(msg);
        drop(items);
        self.available.notify_one();
        outcome
    }

    /// Waits up to `timeout` for the next message.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Outbound> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(msg) = items.pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = match self.available.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Takes every queued message without waiting.
    pub fn drain(&self) -> Vec<Outbound> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn msg(s: &str) -> Outbound {
        Arc::from(s)
    }

    #[test]
    fn delivers_in_fifo_order() {
        let queue = OutboundQueue::unbounded();
        for i in 0..100 {
            assert_eq!(queue.push(msg(&i.to_string())), PushOutcome::Queued);
        }
        for i in 0..100 {
            let next = queue.pop_timeout(Duration::ZERO).unwrap();
            assert_eq!(&*next, i.to_string());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(msg("a"));
        queue.push(msg("b"));
        assert_eq!(queue.push(msg("c")), PushOutcome::DroppedOldest);
        let left: Vec<_> = queue.drain().iter().map(|m| m.to_string()).collect();
        assert_eq!(left, vec!["b", "c"]);
    }

    #[test]
    fn disconnect_policy_refuses_when_full() {
        let queue = OutboundQueue::new(1, OverflowPolicy::Disconnect);
        assert_eq!(queue.push(msg("a")), PushOutcome::Queued);
        assert_eq!(queue.push(msg("b")), PushOutcome::Overflow);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = OutboundQueue::unbounded();
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(OutboundQueue::unbounded());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(msg("late"));
            })
        };
        let got = queue.pop_timeout(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("drop_oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!("disconnect".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Disconnect);
        assert!("nope".parse::<OverflowPolicy>().is_err());
    }
}
