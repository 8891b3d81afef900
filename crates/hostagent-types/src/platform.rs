//! Management-plane records: managers and the central registration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a remote manager allowed to control this host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerKey {
    /// VIP address of the manager's platform.
    pub address: String,
    /// Identity of the manager agent on that platform.
    pub identity: String,
}

impl ManagerKey {
    pub fn new(address: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for ManagerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.address)
    }
}

/// Payload returned by `GET http://{discovery_address}/discovery/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    #[serde(rename = "vip-address", default)]
    pub vip_address: String,
    #[serde(default)]
    pub serverkey: String,
}

/// The persisted trust relationship with a central management instance.
///
/// Stored on disk as `{discovery_address, vip-address, serverkey}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralRegistration {
    pub discovery_address: String,
    #[serde(rename = "vip-address")]
    pub vip_address: String,
    pub serverkey: String,
}

impl CentralRegistration {
    /// Build a registration from a completed discovery exchange.
    pub fn from_discovery(discovery_address: impl Into<String>, info: DiscoveryInfo) -> Self {
        Self {
            discovery_address: discovery_address.into(),
            vip_address: info.vip_address,
            serverkey: info.serverkey,
        }
    }
}

/// Where this host stands in its relationship with a central instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    /// No registration held. Terminal when nothing is configured.
    Unregistered,
    /// Discovery handshake in flight.
    Discovering,
    /// Registration persisted, no live control channel.
    Bootstrapped,
    /// Dialling the central instance.
    Connecting,
    /// Live channel established and allow-list updated.
    Managed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Discovering => "discovering",
            Self::Bootstrapped => "bootstrapped",
            Self::Connecting => "connecting",
            Self::Managed => "managed",
        };
        f.write_str(s)
    }
}
