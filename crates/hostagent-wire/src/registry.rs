//! Peer registry: tracks the identities currently attached to a node.
//!
//! Every inbound connection registers under the identity it presented in
//! its handshake. The node routes calls by looking that identity up here
//! and writing to the peer's outbox.

use crate::message::WireMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// An entry representing a single attached peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Identity announced in the handshake.
    pub identity: String,
    /// Public key announced in the handshake, if any.
    pub public_key: Option<String>,
    /// Socket address of the peer.
    pub address: SocketAddr,
    /// When the peer attached.
    pub connected_at: DateTime<Utc>,
    /// Protocol version negotiated during handshake.
    pub protocol_version: u32,
    /// Topic prefixes the peer subscribed to.
    pub subscriptions: Vec<String>,
    /// Frames queued here are written to the peer's socket.
    pub outbox: mpsc::UnboundedSender<WireMessage>,
}

impl PeerEntry {
    /// Whether any subscription prefix matches `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|p| topic.starts_with(p.as_str()))
    }
}

/// Thread-safe registry of attached peers, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer after a successful handshake. Returns `false` and
    /// leaves the registry untouched when the identity is already taken.
    pub fn add_peer(&self, entry: PeerEntry) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&entry.identity) {
            return false;
        }
        peers.insert(entry.identity.clone(), entry);
        true
    }

    /// Remove a peer entirely.
    pub fn remove_peer(&self, identity: &str) -> Option<PeerEntry> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(identity)
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, identity: &str) -> Option<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(identity)
    }

    /// Add a topic prefix to a peer's subscriptions.
    pub fn subscribe(&self, identity: &str, prefix: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(identity) {
            if !entry.subscriptions.iter().any(|p| p == prefix) {
                entry.subscriptions.push(prefix.to_string());
            }
        }
    }

    /// Peers subscribed to `topic`, excluding `except`.
    pub fn subscribers(&self, topic: &str, except: &str) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.identity != except && p.is_subscribed(topic))
            .cloned()
            .collect()
    }

    /// Identities of all attached peers, sorted.
    pub fn identities(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of attached peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(identity: &str) -> (PeerEntry, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = PeerEntry {
            identity: identity.to_string(),
            public_key: None,
            address: "127.0.0.1:9000".parse().unwrap(),
            connected_at: Utc::now(),
            protocol_version: 1,
            subscriptions: Vec::new(),
            outbox: tx,
        };
        (entry, rx)
    }

    #[test]
    fn test_add_and_remove_peer() {
        let registry = PeerRegistry::new();
        let (entry, _rx) = make_entry("control");
        assert!(registry.add_peer(entry));
        assert!(registry.contains("control"));
        assert_eq!(registry.connected_count(), 1);

        let removed = registry.remove_peer("control");
        assert!(removed.is_some());
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = make_entry("control");
        let (second, _rx2) = make_entry("control");
        assert!(registry.add_peer(first));
        assert!(!registry.add_peer(second));
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_subscribers_match_prefix() {
        let registry = PeerRegistry::new();
        let (a, _rxa) = make_entry("central");
        let (b, _rxb) = make_entry("listener");
        registry.add_peer(a);
        registry.add_peer(b);
        registry.subscribe("central", "platforms/");
        registry.subscribe("central", "platforms/");
        registry.subscribe("listener", "/platform");

        let subs = registry.subscribers("platforms/p1/agents", "");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].identity, "central");
        assert_eq!(subs[0].subscriptions.len(), 1);

        // The publisher itself is excluded.
        assert!(registry.subscribers("platforms/p1/agents", "central").is_empty());
        assert_eq!(registry.identities(), vec!["central", "listener"]);
    }
}
