//! Peer registry: nickname -> last known link and last-seen time.
//!
//! Peers are never removed; stale ones simply drop out of the active projection.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::PEER_TIMEOUT_MS;
use crate::router::LinkId;

/// What we last heard from a peer. `nickname` is self-declared, not authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub nickname: String,
    pub address: LinkId,
    /// Monotonic receipt time, ms.
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn is_active(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) < PEER_TIMEOUT_MS
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerInfo>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a peer seen via `address` at `now`.
    pub fn upsert(&mut self, nickname: &str, address: LinkId, now: u64) {
        self.peers.insert(
            nickname.to_string(),
            PeerInfo {
                nickname: nickname.to_string(),
                address,
                last_seen: now,
            },
        );
    }

    /// Refresh `last_seen` of a known peer. Unknown nicknames are ignored.
    pub fn touch(&mut self, nickname: &str, now: u64) -> bool {
        match self.peers.get_mut(nickname) {
            Some(p) => {
                p.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, nickname: &str) -> Option<&PeerInfo> {
        self.peers.get(nickname)
    }

    /// Nicknames heard from within the last `PEER_TIMEOUT_MS`.
    pub fn active_nicknames(&self, now: u64) -> BTreeSet<String> {
        self.peers
            .values()
            .filter(|p| p.is_active(now))
            .map(|p| p.nickname.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_window() {
        let t = 10_000;
        let mut reg = PeerRegistry::new();
        reg.upsert("bob", LinkId(1), t);
        assert!(reg.active_nicknames(t + 59_000).contains("bob"));
        assert!(!reg.active_nicknames(t + 61_000).contains("bob"));
        // Still retained after falling out of the active view.
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn touch_refreshes_known_only() {
        let mut reg = PeerRegistry::new();
        reg.upsert("bob", LinkId(1), 0);
        assert!(reg.touch("bob", 50_000));
        assert!(reg.active_nicknames(100_000).contains("bob"));

        assert!(!reg.touch("carol", 50_000));
        assert!(reg.get("carol").is_none());
    }

    #[test]
    fn upsert_moves_address() {
        let mut reg = PeerRegistry::new();
        reg.upsert("bob", LinkId(1), 0);
        reg.upsert("bob", LinkId(2), 5);
        let bob = reg.get("bob").unwrap();
        assert_eq!(bob.address, LinkId(2));
        assert_eq!(bob.last_seen, 5);
    }
}
