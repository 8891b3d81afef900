//! Allow-list credential store backed by `{home}/auth.json`.
//!
//! The file holds `{"allow": [{credentials, capabilities}, ...]}`. Entries are
//! keyed by `CURVE:{public key}`; capabilities are only ever added. Other
//! entries, unknown fields and other top-level sections are written back
//! unchanged. A file that does not parse is never overwritten.

use hostagent_types::capability::{curve_credential, AllowEntry, Capability};
use hostagent_types::error::{PlatformError, PlatformResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// File name of the allow-list under the agent home.
pub const AUTH_FILE: &str = "auth.json";

/// Durable record of which public keys hold which capabilities.
pub trait CredentialStore: Send + Sync {
    /// Ensure an entry for `public_key` exists and carries `capabilities`.
    /// Idempotent: no duplicate entries or duplicate capabilities.
    fn add_capabilities(&self, public_key: &str, capabilities: &[Capability]) -> PlatformResult<()>;

    /// Capabilities currently granted to `public_key`.
    fn capabilities(&self, public_key: &str) -> Vec<Capability>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthDocument {
    #[serde(default)]
    allow: Vec<AllowEntry>,
    /// Other top-level sections are preserved as-is.
    #[serde(flatten)]
    other: Map<String, Value>,
}

/// [`CredentialStore`] over a JSON file. The file is re-read on every
/// operation so that external edits are respected.
#[derive(Debug)]
pub struct AuthFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuthFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The store at `{home}/auth.json`.
    pub fn in_home(home: &Path) -> Self {
        Self::new(home.join(AUTH_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> PlatformResult<AuthDocument> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AuthDocument::default())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&strip_comments(&raw)).map_err(|e| {
            PlatformError::Config(format!("invalid allow-list {}: {e}", self.path.display()))
        })
    }

    fn write(&self, doc: &AuthDocument) -> PlatformResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(doc)?)?;
        Ok(())
    }
}

impl CredentialStore for AuthFile {
    fn add_capabilities(&self, public_key: &str, capabilities: &[Capability]) -> PlatformResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let credential = curve_credential(public_key);
        let mut doc = self.read()?;

        let index = match doc.allow.iter().position(|e| e.credentials == credential) {
            Some(i) => i,
            None => {
                debug!(credential = %credential, "Appending new credential");
                doc.allow.push(AllowEntry::new(credential.clone()));
                doc.allow.len() - 1
            }
        };
        let entry = &mut doc.allow[index];
        for cap in capabilities {
            entry.capabilities.insert(cap.clone());
        }

        self.write(&doc)?;
        info!(credential = %credential, "Allow-list updated");
        Ok(())
    }

    fn capabilities(&self, public_key: &str) -> Vec<Capability> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let credential = curve_credential(public_key);
        match self.read() {
            Ok(doc) => doc
                .allow
                .iter()
                .find(|e| e.credentials == credential)
                .map(|e| e.capabilities.to_vec())
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Allow-list unreadable");
                Vec::new()
            }
        }
    }
}

/// Drop whole-line `#` and `//` comments.
fn strip_comments(raw: &str) -> String {
    raw.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with('#') || trimmed.starts_with("//"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
