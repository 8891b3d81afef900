//! Configuration loading from `~/.hostagent/config.toml` with defaults.

use hostagent_types::config::{default_home, PlatformConfig, HOME_ENV};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load agent configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file never fails startup: the problem
/// is logged and the defaults are used.
pub fn load_config(path: Option<&Path>) -> PlatformConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return PlatformConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<PlatformConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                PlatformConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            PlatformConfig::default()
        }
    }
}

/// Get the default config file path: `$HOSTAGENT_HOME/config.toml` or
/// `~/.hostagent/config.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var(HOME_ENV)
        .ok()
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_home)
        .join("config.toml")
}
