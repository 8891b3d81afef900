//! Durable key/value settings, stored as one JSON object.

use hostagent_types::error::PlatformResult;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// File name of the settings store under the agent home.
pub const SETTINGS_FILE: &str = "platform.settings";

/// Opaque settings map, rewritten wholesale on every write.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl SettingsStore {
    /// Open the store at `path`. A missing or corrupt file yields an empty
    /// map.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Map<String, Value>>(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings");
                Map::new()
            }),
            Err(_) => Map::new(),
        };
        Self {
            path,
            values: RwLock::new(values),
        }
    }

    /// Open `{home}/platform.settings`.
    pub fn in_home(home: &Path) -> Self {
        Self::open(home.join(SETTINGS_FILE))
    }

    /// Store `value` under `key` and persist the whole map.
    pub fn set(&self, key: &str, value: Value) -> PlatformResult<()> {
        debug!(key, "Setting value");
        let snapshot = {
            let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
            values.insert(key.to_string(), value);
            values.clone()
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(&snapshot)?)?;
        Ok(())
    }

    /// The value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }
}
