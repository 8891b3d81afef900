//! Registered managers and the sibling lists they report.
//!
//! A manager is a remote `(address, identity)` pair allowed to control this
//! host. Each one is periodically asked for `list_platform_details`; the
//! answer lists sibling platforms that receive `publish_to_peers` fan-out.

use crate::rpc::bounded_call;
use dashmap::DashMap;
use futures::future::join_all;
use hostagent_types::platform::ManagerKey;
use hostagent_wire::PeerConnectionCache;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a `publish_to_peers` fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Managers, their last-known reachability, and their sibling snapshots.
#[derive(Debug, Default)]
pub struct ManagerRegistry {
    /// Written on every refresh, never consulted to skip a manager.
    reachable: DashMap<ManagerKey, bool>,
    siblings: DashMap<ManagerKey, Value>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager. Idempotent; always returns `true`.
    pub fn add(&self, key: ManagerKey) -> bool {
        info!(manager = %key, "Manager registered");
        self.reachable.insert(key, true);
        true
    }

    /// Forget a manager together with its reachability and sibling entries.
    pub fn remove(&self, key: &ManagerKey) -> bool {
        self.siblings.remove(key);
        self.reachable.remove(key).is_some()
    }

    /// Registered managers, sorted.
    pub fn managers(&self) -> Vec<ManagerKey> {
        let mut keys: Vec<ManagerKey> = self.reachable.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn is_reachable(&self, key: &ManagerKey) -> Option<bool> {
        self.reachable.get(key).map(|r| *r)
    }

    /// Last successful `list_platform_details` answer from `key`.
    pub fn siblings(&self, key: &ManagerKey) -> Option<Value> {
        self.siblings.get(key).map(|v| v.value().clone())
    }

    /// Ask every manager for its sibling list.
    ///
    /// Success replaces the manager's snapshot; any failure is logged and
    /// leaves the previous snapshot in place.
    pub async fn refresh_siblings(&self, cache: &PeerConnectionCache, timeout: Duration) {
        for key in self.managers() {
            let result = match cache.acquire(&key.address).await {
                Ok(conn) => {
                    bounded_call(
                        &*conn,
                        &key.identity,
                        "list_platform_details",
                        vec![],
                        Map::new(),
                        timeout,
                    )
                    .await
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(details) => {
                    debug!(manager = %key, "Sibling list refreshed");
                    self.siblings.insert(key.clone(), details);
                    self.reachable.insert(key, true);
                }
                Err(e) => {
                    error!(manager = %key, error = %e, "Could not reach manager");
                    self.reachable.insert(key, false);
                }
            }
        }
    }

    /// Every distinct address found in the sibling snapshots.
    pub fn sibling_addresses(&self) -> BTreeSet<String> {
        let mut addresses = BTreeSet::new();
        for entry in self.siblings.iter() {
            let Some(items) = entry.value().as_array() else {
                warn!(manager = %entry.key(), "Sibling list is not an array");
                continue;
            };
            for item in items {
                let address = match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(o) => o
                        .get("address")
                        .or_else(|| o.get("vip_address"))
                        .and_then(Value::as_str),
                    _ => None,
                };
                match address {
                    Some(a) if !a.is_empty() => {
                        addresses.insert(a.to_string());
                    }
                    _ => debug!(manager = %entry.key(), "Skipping sibling without address"),
                }
            }
        }
        addresses
    }

    /// Publish `message` on `topic` to every sibling address, concurrently
    /// and best-effort. One failing peer never stops the others.
    pub async fn publish_to_peers(
        &self,
        cache: &PeerConnectionCache,
        topic: &str,
        message: &Value,
        headers: &Map<String, Value>,
    ) -> PublishReport {
        let addresses = self.sibling_addresses();
        debug!(topic, peers = addresses.len(), "Publishing to peers");

        let attempts = addresses.into_iter().map(|address| async move {
            let outcome = match cache.acquire(&address).await {
                Ok(conn) => conn.publish(topic, headers.clone(), message.clone()).await,
                Err(e) => Err(e),
            };
            (address, outcome)
        });

        let mut report = PublishReport::default();
        for (address, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.delivered.push(address),
                Err(e) => {
                    error!(peer = %address, error = %e, "Could not publish to peer");
                    report.failed.push(address);
                }
            }
        }
        report
    }
}
