//! The process-control collaborator.
//!
//! Installing, starting and stopping OS processes is not done here; it is
//! delegated to a `control` service attached to the local node.

use crate::rpc::bounded_call;
use async_trait::async_trait;
use hostagent_types::agent::{AgentRecord, AgentStatusRecord, ProcessStatus};
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_wire::PeerConnection;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-agent operations delegated to the control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    AgentStatus,
    StartAgent,
    StopAgent,
    RestartAgent,
    RemoveAgent,
}

impl LifecycleOp {
    /// The control-service method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::AgentStatus => "agent_status",
            Self::StartAgent => "start_agent",
            Self::StopAgent => "stop_agent",
            Self::RestartAgent => "restart_agent",
            Self::RemoveAgent => "remove_agent",
        }
    }

    /// Operations reachable through `route_request`. `restart_agent` is only
    /// exposed as a direct RPC.
    pub fn routable(method: &str) -> Option<Self> {
        match method {
            "agent_status" => Some(Self::AgentStatus),
            "start_agent" => Some(Self::StartAgent),
            "stop_agent" => Some(Self::StopAgent),
            "remove_agent" => Some(Self::RemoveAgent),
            _ => None,
        }
    }
}

/// The control service as seen by the router.
#[async_trait]
pub trait ControlService: Send + Sync {
    /// Installed agents.
    async fn list_agents(&self) -> PlatformResult<Vec<AgentRecord>>;

    /// Process status of every installed agent.
    async fn status_agents(&self) -> PlatformResult<Vec<AgentStatusRecord>>;

    /// Run `op` against one agent. `None` when the service returned no
    /// status.
    async fn lifecycle(&self, op: LifecycleOp, uuid: &str) -> PlatformResult<Option<ProcessStatus>>;

    /// Install the package at `path`, returning the new agent's uuid.
    async fn send_agent(&self, path: &Path, timeout: Duration) -> PlatformResult<String>;
}

/// [`ControlService`] reached by RPC over the local connection.
pub struct RpcControlService {
    conn: Arc<dyn PeerConnection>,
    identity: String,
    timeout: Duration,
}

impl RpcControlService {
    pub fn new(conn: Arc<dyn PeerConnection>, identity: impl Into<String>, timeout: Duration) -> Self {
        Self {
            conn,
            identity: identity.into(),
            timeout,
        }
    }

    async fn call(&self, method: &str, args: Vec<Value>, timeout: Duration) -> PlatformResult<Value> {
        bounded_call(&*self.conn, &self.identity, method, args, Map::new(), timeout).await
    }
}

/// Read an optional status out of a raw control reply. Anything that is
/// not a `[pid, code]` pair counts as "no status".
fn parse_status(value: Value) -> Option<ProcessStatus> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<ProcessStatus>(value) {
        Ok(status) => Some(status),
        Err(e) => {
            debug!(error = %e, "Control reply is not a process status");
            None
        }
    }
}

#[async_trait]
impl ControlService for RpcControlService {
    async fn list_agents(&self) -> PlatformResult<Vec<AgentRecord>> {
        let value = self.call("list_agents", vec![], self.timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn status_agents(&self) -> PlatformResult<Vec<AgentStatusRecord>> {
        let value = self.call("status_agents", vec![], self.timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn lifecycle(&self, op: LifecycleOp, uuid: &str) -> PlatformResult<Option<ProcessStatus>> {
        let value = self
            .call(op.method(), vec![Value::String(uuid.to_string())], self.timeout)
            .await?;
        Ok(parse_status(value))
    }

    async fn send_agent(&self, path: &Path, timeout: Duration) -> PlatformResult<String> {
        let value = self
            .call(
                "send_agent",
                vec![Value::String(path.to_string_lossy().into_owned())],
                timeout,
            )
            .await?;
        match value {
            Value::String(uuid) => Ok(uuid),
            other => Err(PlatformError::Internal(format!(
                "send_agent returned {other} instead of a uuid"
            ))),
        }
    }
}
