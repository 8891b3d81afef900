//! Wire protocol message types.
//!
//! Every frame is a JSON document prefixed with a 4-byte big-endian length
//! header. Calls address a target *identity*; the node a connection is
//! attached to either answers for that identity itself or forwards the call
//! to the peer that registered it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID. Responses echo the ID of their request.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Wrap a request under a fresh ID.
    pub fn request(req: WireRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Request(req),
        }
    }

    /// Answer the request with ID `id`.
    pub fn response(id: impl Into<String>, resp: WireResponse) -> Self {
        Self {
            id: id.into(),
            kind: WireMessageKind::Response(resp),
        }
    }

    /// Wrap a one-way notification under a fresh ID.
    pub fn notification(notif: WireNotification) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Notification(notif),
        }
    }
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    #[serde(rename = "request")]
    Request(WireRequest),
    #[serde(rename = "response")]
    Response(WireResponse),
    /// One-way, no response expected.
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WireRequest {
    /// First frame on every connection: announce the caller's identity.
    #[serde(rename = "handshake")]
    Handshake {
        /// Identity the connecting peer registers under.
        identity: String,
        /// The peer's public key (base64url), used for capability lookups.
        #[serde(default)]
        public_key: String,
        protocol_version: u32,
        /// Random nonce for HMAC authentication.
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + identity).
        auth_hmac: String,
    },
    /// Invoke `method` on the peer registered as `peer`.
    #[serde(rename = "call")]
    Call {
        peer: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        /// Identity of the original caller, filled in by the node when the
        /// call is forwarded.
        #[serde(default)]
        sender: Option<String>,
        /// Public key of the original caller, filled in by the node.
        #[serde(default)]
        sender_key: Option<String>,
    },
    /// Check that `peer` is reachable through this node.
    #[serde(rename = "ping")]
    Ping { peer: String },
}

/// Response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WireResponse {
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        /// Identity hosted by the node.
        identity: String,
        protocol_version: u32,
        nonce: String,
        auth_hmac: String,
    },
    /// Successful call result.
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "pong")]
    Pong {
        /// The identity that answered.
        identity: String,
        uptime_secs: u64,
    },
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    /// Pub/sub message. The node delivers it to its host and to every
    /// connected peer subscribed to a prefix of `topic`.
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        #[serde(default)]
        headers: Map<String, Value>,
        #[serde(default)]
        message: Value,
        #[serde(default)]
        sender: Option<String>,
    },
    /// Ask the node to forward publishes whose topic starts with `prefix`.
    #[serde(rename = "subscribe")]
    Subscribe { prefix: String },
    /// Peer is shutting down.
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
