//! Transport collaborator traits.
//!
//! The router only talks to peers through these traits. [`crate::client`]
//! and [`crate::node`] provide the TCP implementation; tests substitute
//! in-memory doubles.

use async_trait::async_trait;
use hostagent_types::error::PlatformError;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection to {0} is not ready")]
    NotReady(String),
    #[error("Connection to {address} not ready after {timeout_secs}s")]
    ConnectTimeout { address: String, timeout_secs: u64 },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<WireError> for PlatformError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Remote { code, message } => PlatformError::from_code(code, message),
            WireError::ConnectTimeout {
                address,
                timeout_secs,
            } => PlatformError::ConnectTimeout {
                address,
                timeout_secs,
            },
            WireError::InvalidAddress(a) => PlatformError::InvalidParams(format!("address {a}")),
            WireError::Json(e) => PlatformError::Serialization(e),
            other => PlatformError::Unreachable(other.to_string()),
        }
    }
}

/// Who is calling, as established by the transport handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Identity of the caller.
    pub sender: String,
    /// Public key presented in the caller's handshake.
    pub public_key: Option<String>,
}

impl CallContext {
    pub fn new(sender: impl Into<String>, public_key: Option<String>) -> Self {
        Self {
            sender: sender.into(),
            public_key,
        }
    }
}

/// A live (or establishing) RPC channel to one address.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// The address this connection was opened against.
    fn address(&self) -> &str;

    /// Drive the connection until it closes: dial, handshake, then pump
    /// frames. Spawned as a background task by whoever opens the connection.
    async fn run(self: Arc<Self>);

    /// Resolve once the handshake completed, or fail if the connection
    /// closed first. Not time-bounded; callers wrap it in a timeout.
    async fn ready(&self) -> Result<(), WireError>;

    /// Call `method` on `peer`. Not time-bounded.
    async fn call(
        &self,
        peer: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WireError>;

    /// Best-effort pub/sub publish.
    async fn publish(
        &self,
        topic: &str,
        headers: Map<String, Value>,
        message: Value,
    ) -> Result<(), WireError>;

    /// Succeeds when `peer` answers through this connection.
    async fn ping(&self, peer: &str) -> Result<(), WireError>;
}

/// Opens connections to addresses.
pub trait RpcTransport: Send + Sync + 'static {
    /// Create a connection object for `address` without dialling yet.
    fn open(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError>;
}

/// The host side of a node: answers calls addressed to the node's own
/// identity and receives publishes.
#[async_trait]
pub trait PeerHandle: Send + Sync + 'static {
    /// The identity this handle answers for.
    fn identity(&self) -> &str;

    /// Handle a call addressed to [`PeerHandle::identity`].
    async fn handle_call(
        &self,
        ctx: &CallContext,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, PlatformError>;

    /// Receive a publish delivered through the node.
    async fn handle_publish(
        &self,
        ctx: &CallContext,
        topic: &str,
        headers: &Map<String, Value>,
        message: &Value,
    );

    /// Seconds since the host started.
    fn uptime_secs(&self) -> u64;
}
