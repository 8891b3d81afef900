//! Host agent wire layer: addressable RPC and pub/sub between peers.
//!
//! ## Architecture
//!
//! - **PeerNode**: TCP listener hosting one identity and routing calls
//!   between the peers connected to it
//! - **TcpConnection**: client side of a node connection
//! - **PeerConnectionCache**: at most one live connection per address
//! - **PeerHandle**: trait through which a node hands calls to its host
//! - **WireMessage**: JSON-framed protocol messages

pub mod cache;
pub mod client;
pub mod handshake;
pub mod message;
pub mod node;
pub mod registry;
pub mod transport;

pub use cache::PeerConnectionCache;
pub use client::{ClientConfig, TcpConnection, TcpTransport};
pub use message::{WireMessage, WireNotification, WireRequest, WireResponse};
pub use node::{NodeConfig, PeerNode};
pub use registry::{PeerEntry, PeerRegistry};
pub use transport::{CallContext, PeerConnection, PeerHandle, RpcTransport, WireError};
