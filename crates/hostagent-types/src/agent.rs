//! Agent inventory and status types exchanged with the control service.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name fragments that mark an agent as part of the management plane.
/// Such agents cannot be stopped through the router.
pub const PROTECTED_AGENT_MARKERS: &[&str] = &["volttroncentral", "vcplatform"];

/// Raw process status as reported by the control service.
///
/// Serialized as a two element array `[process_id, return_code]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus(pub Option<i64>, pub Option<i64>);

impl ProcessStatus {
    /// OS process id, if the agent was ever started.
    pub fn process_id(&self) -> Option<i64> {
        self.0
    }

    /// Exit code, if the process has terminated.
    pub fn return_code(&self) -> Option<i64> {
        self.1
    }

    /// An agent is running when it has a positive pid and no exit code.
    pub fn is_running(&self) -> bool {
        matches!(self.0, Some(pid) if pid > 0) && self.1.is_none()
    }
}

/// One entry of the control service's `status_agents` reply.
///
/// On the wire this is the tuple `[uuid, name, [pid, code]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(String, String, ProcessStatus)",
    into = "(String, String, ProcessStatus)"
)]
pub struct AgentStatusRecord {
    pub uuid: String,
    pub name: String,
    pub status: ProcessStatus,
}

impl From<(String, String, ProcessStatus)> for AgentStatusRecord {
    fn from((uuid, name, status): (String, String, ProcessStatus)) -> Self {
        Self { uuid, name, status }
    }
}

impl From<AgentStatusRecord> for (String, String, ProcessStatus) {
    fn from(r: AgentStatusRecord) -> Self {
        (r.uuid, r.name, r.status)
    }
}

/// Flattened status row returned by `route_request("status_agents")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusSummary {
    pub name: String,
    pub uuid: String,
    pub process_id: Option<i64>,
    pub return_code: Option<i64>,
}

impl From<&AgentStatusRecord> for AgentStatusSummary {
    fn from(r: &AgentStatusRecord) -> Self {
        Self {
            name: r.name.clone(),
            uuid: r.uuid.clone(),
            process_id: r.status.process_id(),
            return_code: r.status.return_code(),
        }
    }
}

/// Installed agent as listed by the control service.
///
/// Fields beyond `uuid` and `name` are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Health block attached to every listed agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub health: String,
    pub context: String,
    /// UTC ISO-8601 timestamp.
    pub last_updated: String,
}

impl AgentHealth {
    /// The fixed placeholder reported until a real health model exists.
    pub fn initial() -> Self {
        Self {
            health: "GOOD".to_string(),
            context: "Initial Set".to_string(),
            last_updated: Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }
}

/// An inventory entry merged with its derived runtime fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentListing {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub process_id: Option<i64>,
    pub error_code: Option<i64>,
    pub is_running: bool,
    pub can_stop: bool,
    pub can_start: bool,
    pub can_restart: bool,
    pub health: AgentHealth,
}

impl AgentListing {
    /// Merge an inventory record with its status (if the control service
    /// reported one).
    pub fn new(record: AgentRecord, status: Option<ProcessStatus>) -> Self {
        let status = status.unwrap_or_default();
        let can_stop = !is_protected_agent(&record.name);
        Self {
            record,
            process_id: status.process_id(),
            error_code: status.return_code(),
            is_running: status.is_running(),
            can_stop,
            can_start: true,
            can_restart: true,
            health: AgentHealth::initial(),
        }
    }
}

/// Whether the agent name marks a central-management or platform agent.
pub fn is_protected_agent(name: &str) -> bool {
    PROTECTED_AGENT_MARKERS.iter().any(|m| name.contains(m))
}
