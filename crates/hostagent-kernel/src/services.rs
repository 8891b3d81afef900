//! Runtime registry of local services addressable by short alias.

use crate::rpc::bounded_ping;
use dashmap::DashMap;
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_wire::PeerConnection;
use std::time::Duration;
use tracing::info;

/// Identity prefix stripped when deriving an alias.
pub const RESERVED_PREFIX: &str = "platform.";

/// Alias under which `identity` is registered.
pub fn alias_for(identity: &str) -> &str {
    identity.strip_prefix(RESERVED_PREFIX).unwrap_or(identity)
}

/// `alias → identity` map. Later registrations overwrite earlier ones.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` after it answers a ping over `local`.
    ///
    /// Nothing is registered when the ping fails or times out.
    pub async fn register(
        &self,
        local: &dyn PeerConnection,
        identity: &str,
        ping_timeout: Duration,
    ) -> PlatformResult<String> {
        if identity.is_empty() {
            return Err(PlatformError::InvalidParams("vip_identity is empty".into()));
        }
        bounded_ping(local, identity, ping_timeout).await?;
        let alias = alias_for(identity).to_string();
        self.services.insert(alias.clone(), identity.to_string());
        info!(alias = %alias, identity, "Service registered");
        Ok(alias)
    }

    /// The identity registered under `alias`.
    pub fn resolve(&self, alias: &str) -> PlatformResult<String> {
        self.services
            .get(alias)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlatformError::NotFound(format!("service alias {alias}")))
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.services.contains_key(alias)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
