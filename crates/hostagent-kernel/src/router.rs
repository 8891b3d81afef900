//! Request router.
//!
//! `route(id, method, params)` dispatches in a fixed order: local handlers,
//! per-agent lifecycle operations, `install`, then dotted names. A dotted
//! name is parsed once into a [`RouteTarget`] that either addresses a
//! registered service alias or forwards to an identity on the local node.

use crate::central::CentralRegistrar;
use crate::control::{ControlService, LifecycleOp};
use crate::install::install_agents;
use crate::managers::{ManagerRegistry, PublishReport};
use crate::rpc::bounded_call;
use crate::services::ServiceRegistry;
use crate::settings::SettingsStore;
use hostagent_types::agent::{AgentListing, AgentStatusSummary, ProcessStatus};
use hostagent_types::config::TimeoutConfig;
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_types::platform::ManagerKey;
use hostagent_wire::PeerConnectionCache;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a routed method goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    ListAgents,
    SetSetting,
    GetSetting,
    StatusAgents,
    Lifecycle(LifecycleOp),
    Install,
    /// A registered service; params become keyword arguments.
    Alias { identity: String, method: String },
    /// An identity on the local node; params become one positional argument.
    Forward { identity: String, method: String },
}

impl RouteTarget {
    /// Classify `method`. Dotted names are resolved against `services`;
    /// anything unroutable is `MethodNotFound`.
    pub fn parse(method: &str, services: &ServiceRegistry) -> PlatformResult<Self> {
        match method {
            "list_agents" => return Ok(Self::ListAgents),
            "set_setting" => return Ok(Self::SetSetting),
            "get_setting" => return Ok(Self::GetSetting),
            "status_agents" => return Ok(Self::StatusAgents),
            "install" => return Ok(Self::Install),
            _ => {}
        }
        if let Some(op) = LifecycleOp::routable(method) {
            return Ok(Self::Lifecycle(op));
        }

        let fields: Vec<&str> = method.split('.').collect();
        if let Ok(identity) = services.resolve(fields[0]) {
            let remainder = fields[1..].join(".");
            if remainder.is_empty() {
                return Err(PlatformError::MethodNotFound(format!(
                    "{method}: no method after service alias"
                )));
            }
            return Ok(Self::Alias {
                identity,
                method: remainder,
            });
        }

        if fields.len() < 3 {
            return Err(PlatformError::MethodNotFound(method.to_string()));
        }
        let remainder = fields[3..].join(".");
        if fields[2].is_empty() || remainder.is_empty() {
            return Err(PlatformError::MethodNotFound(method.to_string()));
        }
        Ok(Self::Forward {
            identity: fields[2].to_string(),
            method: remainder,
        })
    }
}

/// Unwrap a JSON-RPC-shaped reply: a mapping with `result` yields the inner
/// value, a mapping with `code` yields the code, anything else passes
/// through.
pub fn normalize_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(result) = map.remove("result") {
                result
            } else if let Some(code) = map.remove("code") {
                code
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// `{process_id, return_code}`, both null when no status is known.
pub fn status_object(status: Option<ProcessStatus>) -> Value {
    let status = status.unwrap_or_default();
    json!({
        "process_id": status.process_id(),
        "return_code": status.return_code(),
    })
}

/// Pull an agent uuid out of `[uuid]`, `{uuid}` or a bare string.
pub fn extract_uuid(params: &Value) -> PlatformResult<String> {
    let uuid = match params {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) if items.len() == 1 => items[0].as_str(),
        Value::Object(map) => map.get("uuid").and_then(Value::as_str),
        _ => None,
    };
    uuid.map(str::to_string).ok_or_else(|| {
        PlatformError::InvalidParams("expected [uuid], {\"uuid\": ...} or a uuid string".into())
    })
}

/// Fetch argument `name` from positional `index` or by keyword.
pub(crate) fn param(params: &Value, index: usize, name: &str) -> Option<Value> {
    match params {
        Value::Array(items) => items.get(index).cloned(),
        Value::Object(map) => map.get(name).cloned(),
        _ => None,
    }
}

pub(crate) fn required_str(params: &Value, index: usize, name: &str) -> PlatformResult<String> {
    match param(params, index, name) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PlatformError::InvalidParams(format!("{name} must be a string"))),
        None => Err(PlatformError::InvalidParams(format!("missing {name}"))),
    }
}

/// Bounds for the router's outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct RouterTimeouts {
    pub rpc: Duration,
    pub ping: Duration,
    pub sibling: Duration,
    pub install: Duration,
}

impl From<&TimeoutConfig> for RouterTimeouts {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            rpc: t.rpc(),
            ping: t.ping(),
            sibling: t.sibling(),
            install: t.install(),
        }
    }
}

impl Default for RouterTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// Owns every cache the router consults.
pub struct PlatformRouter {
    cache: Arc<PeerConnectionCache>,
    services: ServiceRegistry,
    managers: ManagerRegistry,
    registrar: CentralRegistrar,
    settings: SettingsStore,
    control: Arc<dyn ControlService>,
    timeouts: RouterTimeouts,
}

impl PlatformRouter {
    pub fn new(
        cache: Arc<PeerConnectionCache>,
        registrar: CentralRegistrar,
        settings: SettingsStore,
        control: Arc<dyn ControlService>,
        timeouts: RouterTimeouts,
    ) -> Self {
        Self {
            cache,
            services: ServiceRegistry::new(),
            managers: ManagerRegistry::new(),
            registrar,
            settings,
            control,
            timeouts,
        }
    }

    pub fn cache(&self) -> &Arc<PeerConnectionCache> {
        &self.cache
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn managers(&self) -> &ManagerRegistry {
        &self.managers
    }

    pub fn registrar(&self) -> &CentralRegistrar {
        &self.registrar
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn control(&self) -> &Arc<dyn ControlService> {
        &self.control
    }

    pub fn timeouts(&self) -> RouterTimeouts {
        self.timeouts
    }

    /// Dispatch `(id, method, params)` and normalize the result.
    pub async fn route(&self, id: &Value, method: &str, params: Value) -> PlatformResult<Value> {
        debug!(id = %id, method, "Routing request");
        let target = RouteTarget::parse(method, &self.services)?;
        let result = self.dispatch(target, params).await?;
        Ok(normalize_result(result))
    }

    async fn dispatch(&self, target: RouteTarget, params: Value) -> PlatformResult<Value> {
        match target {
            RouteTarget::ListAgents => Ok(serde_json::to_value(self.list_agents().await?)?),
            RouteTarget::StatusAgents => Ok(serde_json::to_value(self.status_agents().await?)?),
            RouteTarget::SetSetting => {
                let key = required_str(&params, 0, "key")?;
                let value = param(&params, 1, "value").unwrap_or(Value::Null);
                self.settings.set(&key, value)?;
                Ok(Value::Null)
            }
            RouteTarget::GetSetting => {
                let key = required_str(&params, 0, "key")?;
                Ok(self.settings.get(&key).unwrap_or(Value::Null))
            }
            RouteTarget::Lifecycle(op) => {
                let uuid = extract_uuid(&params)?;
                let status = self.lifecycle_with_status(op, &uuid).await?;
                Ok(status_object(status))
            }
            RouteTarget::Install => {
                let files = match params.get("files") {
                    Some(Value::Array(files)) => files,
                    Some(_) => {
                        return Err(PlatformError::InvalidParams("files must be a list".into()))
                    }
                    None => return Err(PlatformError::InvalidParams("missing files".into())),
                };
                let outcomes =
                    install_agents(&*self.control, files, self.timeouts.install).await?;
                Ok(serde_json::to_value(outcomes)?)
            }
            RouteTarget::Alias { identity, method } => {
                let kwargs = match params {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    _ => {
                        return Err(PlatformError::InvalidParams(
                            "service calls take keyword params".into(),
                        ))
                    }
                };
                let local = self.cache.local();
                bounded_call(&*local, &identity, &method, vec![], kwargs, self.timeouts.rpc).await
            }
            RouteTarget::Forward { identity, method } => {
                debug!(identity = %identity, method = %method, "Forwarding request");
                let local = self.cache.local();
                bounded_call(
                    &*local,
                    &identity,
                    &method,
                    vec![params],
                    Map::new(),
                    self.timeouts.rpc,
                )
                .await
            }
        }
    }

    /// Installed agents merged with their process status. Agents the
    /// control service reports no status for get an empty one.
    pub async fn list_agents(&self) -> PlatformResult<Vec<AgentListing>> {
        let records = self.control.list_agents().await?;
        let statuses: HashMap<String, ProcessStatus> = self
            .control
            .status_agents()
            .await?
            .into_iter()
            .map(|s| (s.uuid, s.status))
            .collect();

        Ok(records
            .into_iter()
            .map(|record| {
                let status = statuses.get(&record.uuid).copied();
                if status.is_none() {
                    debug!(uuid = %record.uuid, "No status reported for agent");
                }
                AgentListing::new(record, status)
            })
            .collect())
    }

    pub async fn status_agents(&self) -> PlatformResult<Vec<AgentStatusSummary>> {
        let records = self.control.status_agents().await?;
        Ok(records.iter().map(AgentStatusSummary::from).collect())
    }

    /// Run `op`, then query `agent_status` as a separate step after a stop
    /// or when the first reply carried no status.
    pub async fn lifecycle_with_status(
        &self,
        op: LifecycleOp,
        uuid: &str,
    ) -> PlatformResult<Option<ProcessStatus>> {
        let status = self.control.lifecycle(op, uuid).await?;
        let needs_status = op == LifecycleOp::StopAgent || status.is_none();
        if needs_status && op != LifecycleOp::AgentStatus {
            return self.control.lifecycle(LifecycleOp::AgentStatus, uuid).await;
        }
        Ok(status)
    }

    /// Ping `identity` over the local connection and register its alias.
    pub async fn register_service(&self, identity: &str) -> PlatformResult<String> {
        self.services
            .register(&*self.cache.local(), identity, self.timeouts.ping)
            .await
    }

    pub fn manage(&self, address: &str, identity: &str) -> bool {
        self.managers.add(ManagerKey::new(address, identity))
    }

    pub async fn refresh_siblings(&self) {
        self.managers
            .refresh_siblings(&self.cache, self.timeouts.sibling)
            .await;
    }

    pub async fn publish_to_peers(
        &self,
        topic: &str,
        message: &Value,
        headers: &Map<String, Value>,
    ) -> PublishReport {
        let report = self
            .managers
            .publish_to_peers(&self.cache, topic, message, headers)
            .await;
        if !report.failed.is_empty() {
            warn!(topic, failed = report.failed.len(), "Some peers missed a publish");
        }
        report
    }

    /// Drive `manage_platform` through the registrar.
    pub async fn manage_platform(&self, uri: &str, central_key: &str) -> PlatformResult<()> {
        self.registrar
            .manage_platform(&self.cache, uri, central_key)
            .await
    }
}
