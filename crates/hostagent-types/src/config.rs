//! Agent configuration, loaded from `~/.hostagent/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default identity the agent answers to on its node.
pub const DEFAULT_IDENTITY: &str = "platform.agent";

/// Default identity of the process-control service.
pub const DEFAULT_CONTROL_IDENTITY: &str = "control";

/// Environment variable overriding the agent home directory.
pub const HOME_ENV: &str = "HOSTAGENT_HOME";

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Identity this agent is reachable under.
    pub identity: String,
    /// Agent id reported in logs and announcements.
    pub agent_id: String,
    /// Agent type reported in announcements.
    pub agent_type: String,
    /// Address the node listens on, e.g. `tcp://127.0.0.1:22916`.
    pub vip_address: String,
    /// `host:port` of a central instance to register with at startup.
    pub discovery_address: Option<String>,
    /// Human-readable platform name.
    pub display_name: Option<String>,
    /// Directory holding persisted state. Defaults to `~/.hostagent`.
    pub home_dir: Option<PathBuf>,
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Reject capability-gated calls from callers lacking the capability.
    /// When false, missing capabilities are only logged.
    pub enforce_capabilities: bool,
    /// Identity of the process-control service on the local node.
    pub control_identity: String,
    pub network: NetworkConfig,
    pub timeouts: TimeoutConfig,
    pub schedule: ScheduleConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            agent_id: "platform".to_string(),
            agent_type: "platform".to_string(),
            vip_address: "tcp://127.0.0.1:22916".to_string(),
            discovery_address: None,
            display_name: None,
            home_dir: None,
            log_level: "info".to_string(),
            log_json: false,
            enforce_capabilities: false,
            control_identity: DEFAULT_CONTROL_IDENTITY.to_string(),
            network: NetworkConfig::default(),
            timeouts: TimeoutConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Resolve the home directory: `HOSTAGENT_HOME`, then `home_dir`, then
    /// `~/.hostagent`.
    pub fn home(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(HOME_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.home_dir.clone().unwrap_or_else(default_home)
    }
}

/// Transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pre-shared key for the HMAC handshake. The node refuses to start
    /// without one.
    pub shared_secret: String,
}

/// Bounds applied to every suspension point, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// New peer connection readiness.
    pub connect_secs: u64,
    /// Forwarded and control-service calls.
    pub rpc_secs: u64,
    /// Liveness probe on service registration.
    pub ping_secs: u64,
    /// `list_platform_details` during sibling refresh.
    pub sibling_secs: u64,
    /// `send_agent` per installed file.
    pub install_secs: u64,
    /// Discovery HTTP exchange.
    pub discovery_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            rpc_secs: 30,
            ping_secs: 5,
            sibling_secs: 10,
            install_secs: 15,
            discovery_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping_secs)
    }

    pub fn sibling(&self) -> Duration {
        Duration::from_secs(self.sibling_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }
}

/// Periodic task intervals, in seconds. Zero disables a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub sibling_refresh_secs: u64,
    pub platform_publish_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sibling_refresh_secs: 30,
            platform_publish_secs: 10,
        }
    }
}

/// `~/.hostagent`, or a temp-dir fallback when no home directory exists.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".hostagent")
}
