//! Peer registry: a flat, last-seen-timestamped map of live peers.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::PeerId;

/// Tracks peers this node has heard a heartbeat from recently. Always
/// includes self, so a single-node cluster still has a registry size of 1.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: PeerId,
    last_seen: DashMap<PeerId, Instant>,
}

impl PeerRegistry {
    pub fn new(self_id: PeerId) -> Self {
        let last_seen = DashMap::new();
        last_seen.insert(self_id.clone(), Instant::now());
        Self { self_id, last_seen }
    }

    /// Record a heartbeat or any other liveness signal from `peer`.
    /// Lazily inserts peers this node has never seen a heartbeat from but
    /// has otherwise learned about (e.g. by proposing to them directly).
    pub fn mark(&self, peer: &str) {
        self.last_seen.insert(peer.to_string(), Instant::now());
    }

    /// Drop peers not seen within `timeout`. Self is never evicted.
    pub fn evict_stale(&self, timeout: Duration) {
        let now = Instant::now();
        let self_id = self.self_id.clone();
        self.last_seen
            .retain(|peer, seen| peer == &self_id || now.duration_since(*seen) <= timeout);
    }

    /// Number of known live peers, including self.
    pub fn size(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_known(&self, peer: &str) -> bool {
        self.last_seen.contains_key(peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.last_seen.iter().map(|e| e.key().clone()).collect()
    }

    /// Peers other than self, in a stable sorted order (for round-robin
    /// search dispatch).
    pub fn other_peers_sorted(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .last_seen
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| p != &self.self_id)
            .collect();
        peers.sort();
        peers
    }

    /// Required vote count for a majority of the known peer set.
    pub fn quorum_size(&self) -> usize {
        self.size() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_always_present() {
        let registry = PeerRegistry::new("node-a".to_string());
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.quorum_size(), 1);
    }

    #[test]
    fn eviction_keeps_self() {
        let registry = PeerRegistry::new("node-a".to_string());
        registry.mark("node-b");
        assert_eq!(registry.size(), 2);
        registry.evict_stale(Duration::from_secs(0));
        assert_eq!(registry.size(), 1);
        assert!(registry.is_known("node-a"));
    }

    #[test]
    fn quorum_grows_with_peers() {
        let registry = PeerRegistry::new("node-a".to_string());
        registry.mark("node-b");
        registry.mark("node-c");
        assert_eq!(registry.size(), 3);
        assert_eq!(registry.quorum_size(), 2);
    }
}
