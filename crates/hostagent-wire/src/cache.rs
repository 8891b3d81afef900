//! Peer connection cache: at most one live connection per address.

use crate::transport::{PeerConnection, RpcTransport, WireError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Arc<dyn PeerConnection>>>;

/// Lazily establishes and memoizes one connection per peer address.
///
/// Entries are never invalidated. A connection that later drops stays
/// cached and its calls fail until the process restarts.
pub struct PeerConnectionCache {
    transport: Arc<dyn RpcTransport>,
    local_address: String,
    local: Arc<dyn PeerConnection>,
    connections: DashMap<String, Slot>,
    connect_timeout: Duration,
}

impl PeerConnectionCache {
    /// `local` is this process's own connection, returned for
    /// `local_address` without a network hop.
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        local_address: impl Into<String>,
        local: Arc<dyn PeerConnection>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            local_address: local_address.into(),
            local,
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    /// The own-address handle.
    pub fn local(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.local)
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Return a ready connection to `address`, establishing it on first use.
    ///
    /// Concurrent callers for the same address share one establishment. A
    /// failed establishment stores nothing, so the next call retries.
    pub async fn acquire(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError> {
        if address == self.local_address {
            return Ok(self.local());
        }

        // Clone the slot out so the map guard is released before awaiting.
        let slot: Slot = self.connections.entry(address.to_string()).or_default().clone();
        let conn = slot.get_or_try_init(|| self.establish(address)).await?;
        Ok(Arc::clone(conn))
    }

    async fn establish(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError> {
        debug!(address, "Opening peer connection");
        let conn = self.transport.open(address)?;
        let driver = tokio::spawn(Arc::clone(&conn).run());

        match tokio::time::timeout(self.connect_timeout, conn.ready()).await {
            Ok(Ok(())) => {
                info!(address, "Peer connection ready");
                Ok(conn)
            }
            Ok(Err(e)) => {
                warn!(address, error = %e, "Peer connection failed");
                driver.abort();
                Err(e)
            }
            Err(_) => {
                warn!(address, timeout_secs = self.connect_timeout.as_secs(), "Peer connection not ready in time");
                driver.abort();
                Err(WireError::ConnectTimeout {
                    address: address.to_string(),
                    timeout_secs: self.connect_timeout.as_secs(),
                })
            }
        }
    }

    /// Addresses with an established connection, sorted.
    pub fn cached_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect();
        addrs.sort();
        addrs
    }
}
