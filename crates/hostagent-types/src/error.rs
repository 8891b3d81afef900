//! Shared error types for the host agent.
//!
//! Every variant maps onto a numeric code so that failures can cross the
//! wire as `{code, message}` pairs and be rebuilt on the caller side.

use thiserror::Error;

/// JSON-RPC: invalid JSON was received.
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC: the payload is not a valid request object.
pub const INVALID_REQUEST: i32 = -32600;
/// JSON-RPC: the method does not exist or is not available.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC: invalid method parameters.
pub const INVALID_PARAMS: i32 = -32602;
/// JSON-RPC: internal error.
pub const INTERNAL_ERROR: i32 = -32603;
/// Unhandled failure inside a remote handler.
pub const UNHANDLED_EXCEPTION: i32 = -32000;

/// Peer did not answer within its deadline.
pub const UNREACHABLE: i32 = -32010;
/// Caller lacks the capability required by the method.
pub const UNAUTHORIZED: i32 = -32011;
/// The discovery handshake with a central instance failed.
pub const DISCOVERY_FAILED: i32 = -32020;
/// A different central instance already manages this platform.
pub const ALREADY_MANAGED: i32 = -32021;
/// An operation needed a central registration that does not exist.
pub const CANNOT_CONNECT: i32 = -32022;
/// A new peer connection did not become ready in time.
pub const CONNECT_TIMEOUT: i32 = -32023;

/// Top-level error type for the host agent.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Malformed caller input. Never retried.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Unknown dispatch target.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// An alias lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A peer failed to respond within its timeout.
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// A peer connection did not become ready within the connect timeout.
    #[error("Connection to {address} not ready after {timeout_secs}s")]
    ConnectTimeout {
        /// The address being dialled.
        address: String,
        /// The bound that elapsed.
        timeout_secs: u64,
    },

    /// The caller lacks a capability.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The discovery handshake failed.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// A different central identity tried to register.
    #[error("Already managed: {0}")]
    AlreadyManaged(String),

    /// A registration-dependent operation ran without a registration.
    #[error("Cannot connect: {0}")]
    CannotConnect(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error reported by a remote handler with a code this side does not
    /// recognise.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Numeric code carried on the wire.
        code: i32,
        /// Message carried on the wire.
        message: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    /// The numeric code sent on the wire for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::MethodNotFound(_) | Self::NotFound(_) => METHOD_NOT_FOUND,
            Self::Unreachable(_) => UNREACHABLE,
            Self::ConnectTimeout { .. } => CONNECT_TIMEOUT,
            Self::Unauthorized(_) => UNAUTHORIZED,
            Self::Discovery(_) => DISCOVERY_FAILED,
            Self::AlreadyManaged(_) => ALREADY_MANAGED,
            Self::CannotConnect(_) => CANNOT_CONNECT,
            Self::Serialization(_) => PARSE_ERROR,
            Self::Remote { code, .. } => *code,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Rebuild an error from a `{code, message}` pair received off the wire.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            INVALID_PARAMS => Self::InvalidParams(message),
            METHOD_NOT_FOUND => Self::MethodNotFound(message),
            UNREACHABLE | CONNECT_TIMEOUT => Self::Unreachable(message),
            UNAUTHORIZED => Self::Unauthorized(message),
            DISCOVERY_FAILED => Self::Discovery(message),
            ALREADY_MANAGED => Self::AlreadyManaged(message),
            CANNOT_CONNECT => Self::CannotConnect(message),
            INTERNAL_ERROR => Self::Internal(message),
            _ => Self::Remote { code, message },
        }
    }

    /// The message sent on the wire next to [`PlatformError::code`]. Drops
    /// the variant prefix so `from_code(code, detail)` displays the same
    /// text on both sides.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidParams(m)
            | Self::MethodNotFound(m)
            | Self::NotFound(m)
            | Self::Unreachable(m)
            | Self::Unauthorized(m)
            | Self::Discovery(m)
            | Self::AlreadyManaged(m)
            | Self::CannotConnect(m)
            | Self::Internal(m) => m.clone(),
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error means "outcome unknown" rather than a definite
    /// remote failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::ConnectTimeout { .. })
    }
}

/// Alias for Result with PlatformError.
pub type PlatformResult<T> = Result<T, PlatformError>;
