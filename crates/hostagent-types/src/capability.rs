//! Capability types stored in the allow-list.
//!
//! A capability is a named permission attached to a credential. The router
//! only ever adds capabilities; it never removes them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Prefix of every allow-list credential.
pub const CURVE_PREFIX: &str = "CURVE:";

/// A named permission granted to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    /// May issue control calls (install/start/stop) against this host.
    CanManage,
    /// Any other capability tag, kept verbatim.
    Named(String),
}

impl Capability {
    /// The tag as written to the allow-list.
    pub fn as_str(&self) -> &str {
        match self {
            Self::CanManage => "can_manage",
            Self::Named(s) => s,
        }
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        match s.as_str() {
            "can_manage" => Self::CanManage,
            _ => Self::Named(s),
        }
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities of one allow-list record: either a list of names or a
/// mapping from name to parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capabilities {
    List(Vec<Capability>),
    Map(Map<String, Value>),
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl Capabilities {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(list) => list.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        match self {
            Self::List(list) => list.contains(capability),
            Self::Map(map) => map.contains_key(capability.as_str()),
        }
    }

    /// Add `capability` unless present. Mapping entries get no parameters.
    pub fn insert(&mut self, capability: Capability) {
        if self.contains(&capability) {
            return;
        }
        match self {
            Self::List(list) => list.push(capability),
            Self::Map(map) => {
                map.insert(capability.as_str().to_string(), Value::Null);
            }
        }
    }

    /// Capability names, in file order.
    pub fn to_vec(&self) -> Vec<Capability> {
        match self {
            Self::List(list) => list.clone(),
            Self::Map(map) => map.keys().cloned().map(Capability::from).collect(),
        }
    }
}

/// One allow-list record. Fields other than `credentials` and
/// `capabilities` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowEntry {
    /// `CURVE:<public key>`.
    pub credentials: String,
    #[serde(default, skip_serializing_if = "Capabilities::is_empty")]
    pub capabilities: Capabilities,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AllowEntry {
    /// An entry for `credentials` with no capabilities.
    pub fn new(credentials: impl Into<String>) -> Self {
        Self {
            credentials: credentials.into(),
            capabilities: Capabilities::default(),
            extra: Map::new(),
        }
    }

    /// Whether this entry carries `capability`.
    pub fn grants(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Build the allow-list credential string for a public key.
pub fn curve_credential(public_key: &str) -> String {
    format!("{CURVE_PREFIX}{public_key}")
}
