//! Sender authorization and the set of rooms output is relayed to.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashSet;

/// Allow-list of senders permitted to write to the shell.
///
/// Built once at startup and never modified.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationPolicy {
    allowed: HashSet<String>,
}

impl AuthorizationPolicy {
    /// Creates a policy allowing exactly `senders`.
    pub fn new<I, S>(senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: senders.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `sender` may drive the shell. Matching is exact.
    pub fn is_allowed(&self, sender: &str) -> bool {
        self.allowed.contains(sender)
    }

    /// Number of allowed senders.
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Returns true if nobody is allowed.
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

/// Rooms that receive shell output.
///
/// Shared between the invite handler, which adds rooms, and the output
/// relay, which reads them. Rooms are never removed.
#[derive(Debug, Clone, Default)]
pub struct BroadcastSet {
    rooms: Arc<DashSet<String>>,
}

impl BroadcastSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a room. Returns true if it was not already present.
    pub fn insert(&self, room_id: impl Into<String>) -> bool {
        self.rooms.insert(room_id.into())
    }

    /// Returns true if the room is in the set.
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    /// Copies the current rooms, sorted for a stable send order.
    pub fn snapshot(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().map(|room| room.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// Number of rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Returns true if there is nowhere to send output.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_exact_match() {
        let policy = AuthorizationPolicy::new(["@alice:example.org"]);

        assert!(policy.is_allowed("@alice:example.org"));
        assert!(!policy.is_allowed("@Alice:example.org"));
        assert!(!policy.is_allowed("@alice:example.org "));
        assert!(!policy.is_allowed("@mallory:example.org"));
        assert_eq!(policy.len(), 1);
    }

    #[test]
    fn test_empty_policy_allows_nobody() {
        let policy = AuthorizationPolicy::default();
        assert!(policy.is_empty());
        assert!(!policy.is_allowed(""));
    }

    #[test]
    fn test_broadcast_set_insert_is_idempotent() {
        let rooms = BroadcastSet::new();

        assert!(rooms.insert("!a:hs"));
        assert!(!rooms.insert("!a:hs"));
        assert_eq!(rooms.len(), 1);
        assert!(rooms.contains("!a:hs"));
    }

    #[test]
    fn test_broadcast_set_clones_share_rooms() {
        let rooms = BroadcastSet::new();
        let writer = rooms.clone();

        writer.insert("!b:hs");
        writer.insert("!a:hs");

        assert_eq!(rooms.snapshot(), vec!["!a:hs", "!b:hs"]);
    }

    #[test]
    fn test_broadcast_set_concurrent_inserts() {
        let rooms = BroadcastSet::new();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let rooms = rooms.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        rooms.insert(format!("!room{}:hs", (t * 50 + i) % 100));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(rooms.len(), 100);
    }
}
