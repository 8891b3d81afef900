//! The agent's persisted Ed25519 identity keypair.
//!
//! The base64url public key identifies this agent to managers: it is sent
//! in the transport handshake and returned by `manage_platform`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use hostagent_types::error::{PlatformError, PlatformResult};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// File name of the keystore under the agent home.
pub const KEYSTORE_FILE: &str = "keystore.json";

/// Public and secret key, both base64url without padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentKeys {
    pub public: String,
    pub secret: String,
}

impl AgentKeys {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(key: &SigningKey) -> Self {
        Self {
            public: URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes()),
            secret: URL_SAFE_NO_PAD.encode(key.to_bytes()),
        }
    }

    /// Rebuild the keypair from its secret half. The public key is always
    /// re-derived so a hand-edited public key cannot drift.
    fn from_secret(secret: &str) -> PlatformResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(secret.trim())
            .map_err(|e| PlatformError::Config(format!("keystore secret: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PlatformError::Config("keystore secret must be 32 bytes".into()))?;
        Ok(Self::from_signing_key(&SigningKey::from_bytes(&bytes)))
    }

    /// Load `{home}/keystore.json`, creating it (mode 0600) when missing or
    /// unusable.
    pub fn load_or_create(home: &Path) -> PlatformResult<Self> {
        let path = home.join(KEYSTORE_FILE);
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<AgentKeys>(&raw)
                .map_err(PlatformError::from)
                .and_then(|k| Self::from_secret(&k.secret))
            {
                Ok(keys) => return Ok(keys),
                Err(e) => warn!(path = %path.display(), error = %e, "Replacing unusable keystore"),
            }
        }

        let keys = Self::generate();
        std::fs::create_dir_all(home)?;
        std::fs::write(&path, serde_json::to_vec_pretty(&keys)?)?;
        restrict_file_permissions(&path);
        info!(path = %path.display(), "Generated agent keypair");
        Ok(keys)
    }
}

/// Restrict file permissions to owner-only (0600) on Unix.
#[cfg(unix)]
pub fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
pub fn restrict_file_permissions(_path: &Path) {}
