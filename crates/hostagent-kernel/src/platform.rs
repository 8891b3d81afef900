//! The platform agent: the RPC surface this host exposes on its node.
//!
//! Arguments arrive either positionally or by name. Calls that change
//! process state are gated on the `can_manage` capability; the gate only
//! logs unless `enforce_capabilities` is set.

use crate::background::BackgroundTasks;
use crate::central::find_registration_address;
use crate::control::LifecycleOp;
use crate::credentials::CredentialStore;
use crate::router::{param, required_str, PlatformRouter};
use crate::rpc::bounded_ping;
use async_trait::async_trait;
use hostagent_types::agent::AgentHealth;
use hostagent_types::capability::Capability;
use hostagent_types::config::PlatformConfig;
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_wire::{CallContext, PeerHandle};
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Identity the central management agent uses on a node.
pub const CENTRAL_IDENTITY: &str = "volttron.central";

/// Topic carrying `available` / `leaving` announcements.
pub const PLATFORM_TOPIC: &str = "/platform";

/// Methods that require `can_manage`.
const MANAGE_METHODS: &[&str] = &["start_agent", "stop_agent", "restart_agent"];

/// Fold positional and keyword arguments into one params value. Keyword
/// arguments win when both are present.
fn call_params(args: Vec<Value>, kwargs: Map<String, Value>) -> Value {
    if kwargs.is_empty() {
        Value::Array(args)
    } else {
        Value::Object(kwargs)
    }
}

pub struct PlatformAgent {
    identity: String,
    public_key: String,
    vip_addresses: Vec<String>,
    enforce_capabilities: bool,
    router: Arc<PlatformRouter>,
    credentials: Arc<dyn CredentialStore>,
    background: BackgroundTasks,
    platform_uuid: RwLock<Option<String>>,
    started_at: Instant,
}

impl PlatformAgent {
    pub fn new(
        config: &PlatformConfig,
        router: Arc<PlatformRouter>,
        credentials: Arc<dyn CredentialStore>,
        public_key: impl Into<String>,
        vip_addresses: Vec<String>,
    ) -> Self {
        Self {
            identity: config.identity.clone(),
            public_key: public_key.into(),
            vip_addresses,
            enforce_capabilities: config.enforce_capabilities,
            router,
            credentials,
            background: BackgroundTasks::new(config.schedule.clone()),
            platform_uuid: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn router(&self) -> &Arc<PlatformRouter> {
        &self.router
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn platform_uuid(&self) -> Option<String> {
        self.platform_uuid
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Startup: registration with central, sibling refresh and the
    /// `available` announcement.
    pub async fn start(&self) {
        info!(identity = %self.identity, "Platform agent starting");
        self.router.registrar().start(self.router.cache()).await;
        self.background.start_sibling_refresh(Arc::clone(&self.router));
        self.announce("available").await;
    }

    /// Shutdown: `leaving` announcement, then stop background loops.
    pub async fn stop(&self) {
        self.announce("leaving").await;
        self.background.shutdown();
        info!(identity = %self.identity, "Platform agent stopped");
    }

    async fn announce(&self, message: &str) {
        let mut headers = Map::new();
        if let Some(address) = find_registration_address(&self.vip_addresses) {
            headers.insert("address".to_string(), Value::String(address));
        }
        let local = self.router.cache().local();
        if let Err(e) = local.publish(PLATFORM_TOPIC, headers, json!(message)).await {
            warn!(error = %e, message, "Could not announce platform");
        }
    }

    fn can_manage(&self, ctx: &CallContext) -> bool {
        ctx.public_key
            .as_deref()
            .map(|key| self.credentials.capabilities(key).contains(&Capability::CanManage))
            .unwrap_or(false)
    }

    fn authorize(&self, ctx: &CallContext, method: &str) -> PlatformResult<()> {
        if !MANAGE_METHODS.contains(&method) || self.can_manage(ctx) {
            return Ok(());
        }
        if self.enforce_capabilities {
            warn!(sender = %ctx.sender, method, "Rejected call lacking can_manage");
            return Err(PlatformError::Unauthorized(format!(
                "{method} requires can_manage"
            )));
        }
        debug!(sender = %ctx.sender, method, "Caller lacks can_manage");
        Ok(())
    }

    /// Start publishing this platform's agents and status under `uuid`.
    pub fn assign_platform_uuid(&self, uuid: &str) {
        info!(platform_uuid = uuid, "Platform uuid assigned");
        *self
            .platform_uuid
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(uuid.to_string());
        self.background
            .start_platform_publisher(Arc::clone(&self.router), uuid.to_string());
    }

    /// Managed when a registration record is held, or a central agent is
    /// attached to the local node.
    pub async fn is_managed(&self) -> bool {
        if self.router.registrar().is_registered() {
            return true;
        }
        let local = self.router.cache().local();
        bounded_ping(&*local, CENTRAL_IDENTITY, self.router.timeouts().ping)
            .await
            .is_ok()
    }

    /// Accept management by the central instance at `uri`. Returns this
    /// agent's public key.
    pub async fn manage_platform(&self, uri: &str, central_key: &str) -> PlatformResult<String> {
        self.router.manage_platform(uri, central_key).await?;
        Ok(self.public_key.clone())
    }

    async fn lifecycle(&self, op: LifecycleOp, uuid: &str) -> PlatformResult<Value> {
        let status = self.router.control().lifecycle(op, uuid).await?;
        match op {
            LifecycleOp::AgentStatus => Ok(serde_json::to_value(status)?),
            _ => Ok(Value::Null),
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> PlatformResult<Value> {
        match method {
            "assign_platform_uuid" => {
                let uuid = required_str(&params, 0, "platform_uuid")?;
                self.assign_platform_uuid(&uuid);
                Ok(Value::Null)
            }
            "get_health" => Ok(serde_json::to_value(AgentHealth::initial())?),
            "is_managed" => Ok(Value::Bool(self.is_managed().await)),
            "manage_platform" => {
                let uri = required_str(&params, 0, "uri")?;
                let key = required_str(&params, 1, "vc_publickey")?;
                Ok(Value::String(self.manage_platform(&uri, &key).await?))
            }
            "set_setting" => {
                let key = required_str(&params, 0, "key")?;
                let value = param(&params, 1, "value").unwrap_or(Value::Null);
                self.router.settings().set(&key, value)?;
                Ok(Value::Null)
            }
            "get_setting" => {
                let key = required_str(&params, 0, "key")?;
                Ok(self.router.settings().get(&key).unwrap_or(Value::Null))
            }
            "publish_to_peers" => {
                let topic = required_str(&params, 0, "topic")?;
                let message = param(&params, 1, "message").unwrap_or(Value::Null);
                let headers = match param(&params, 2, "headers") {
                    Some(Value::Object(map)) => map,
                    Some(Value::Null) | None => Map::new(),
                    Some(_) => {
                        return Err(PlatformError::InvalidParams(
                            "headers must be a mapping".into(),
                        ))
                    }
                };
                self.router
                    .publish_to_peers(&topic, &message, &headers)
                    .await;
                Ok(Value::Null)
            }
            "register_service" => {
                let identity = required_str(&params, 0, "vip_identity")?;
                self.router.register_service(&identity).await?;
                Ok(Value::Null)
            }
            "list_agents" => Ok(serde_json::to_value(self.router.list_agents().await?)?),
            "start_agent" => {
                let uuid = required_str(&params, 0, "agent_uuid")?;
                self.lifecycle(LifecycleOp::StartAgent, &uuid).await
            }
            "stop_agent" => {
                let uuid = required_str(&params, 0, "agent_uuid")?;
                self.lifecycle(LifecycleOp::StopAgent, &uuid).await
            }
            "restart_agent" => {
                let uuid = required_str(&params, 0, "agent_uuid")?;
                self.lifecycle(LifecycleOp::RestartAgent, &uuid).await
            }
            "agent_status" => {
                let uuid = required_str(&params, 0, "agent_uuid")?;
                self.lifecycle(LifecycleOp::AgentStatus, &uuid).await
            }
            "status_agents" => Ok(serde_json::to_value(
                self.router.control().status_agents().await?,
            )?),
            "route_request" => {
                let id = param(&params, 0, "id").unwrap_or(Value::Null);
                let method = required_str(&params, 1, "method")?;
                let inner = param(&params, 2, "params").unwrap_or(Value::Null);
                self.router.route(&id, &method, inner).await
            }
            "manage" => {
                let address = required_str(&params, 0, "address")?;
                let identity = required_str(&params, 1, "identity")?;
                Ok(Value::Bool(self.router.manage(&address, &identity)))
            }
            "list_agent_methods" => Err(PlatformError::Internal("Not implemented".into())),
            other => Err(PlatformError::MethodNotFound(other.to_string())),
        }
    }
}

#[async_trait]
impl PeerHandle for PlatformAgent {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn handle_call(
        &self,
        ctx: &CallContext,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, PlatformError> {
        debug!(sender = %ctx.sender, method, "Platform call");
        self.authorize(ctx, method)?;
        self.dispatch(method, call_params(args, kwargs)).await
    }

    async fn handle_publish(
        &self,
        ctx: &CallContext,
        topic: &str,
        _headers: &Map<String, Value>,
        _message: &Value,
    ) {
        debug!(sender = %ctx.sender, topic, "Publish received");
    }

    fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::{store_registration, CentralRegistrar};
    use crate::router::RouterTimeouts;
    use crate::settings::SettingsStore;
    use crate::testing::{MemoryCredentials, MockConnection, MockControl, MockTransport};
    use hostagent_types::agent::ProcessStatus;
    use hostagent_types::platform::CentralRegistration;
    use hostagent_wire::PeerConnectionCache;
    use std::time::Duration;

    const LOCAL: &str = "tcp://127.0.0.1:22916";
    const CENTRAL_VIP: &str = "tcp://10.0.0.5:22916";

    struct Fixture {
        agent: PlatformAgent,
        local: Arc<MockConnection>,
        control: Arc<MockControl>,
        credentials: Arc<MemoryCredentials>,
        _home: tempfile::TempDir,
    }

    fn fixture(local: MockConnection, enforce: bool) -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let local = Arc::new(local);
        let transport = MockTransport::default().with_peer(MockConnection::new(CENTRAL_VIP));
        let cache = Arc::new(PeerConnectionCache::new(
            Arc::new(transport),
            LOCAL,
            local.clone(),
            Duration::from_secs(1),
        ));
        let credentials = Arc::new(MemoryCredentials::default());
        let control = Arc::new(MockControl::default());
        let router = Arc::new(PlatformRouter::new(
            cache,
            CentralRegistrar::new(home.path(), None, Duration::from_secs(1), credentials.clone())
                .unwrap(),
            SettingsStore::in_home(home.path()),
            control.clone(),
            RouterTimeouts {
                ping: Duration::from_millis(200),
                ..RouterTimeouts::default()
            },
        ));
        let config = PlatformConfig {
            enforce_capabilities: enforce,
            ..PlatformConfig::default()
        };
        let agent = PlatformAgent::new(
            &config,
            router,
            credentials.clone(),
            "agent-public-key",
            vec!["tcp://10.0.0.2:22916".to_string()],
        );
        Fixture {
            agent,
            local,
            control,
            credentials,
            _home: home,
        }
    }

    fn ctx(key: Option<&str>) -> CallContext {
        CallContext::new("caller", key.map(str::to_string))
    }

    #[tokio::test]
    async fn test_positional_and_named_arguments() {
        let f = fixture(MockConnection::new(LOCAL), false);
        f.agent
            .handle_call(&ctx(None), "set_setting", vec![json!("k"), json!(1)], Map::new())
            .await
            .unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("key".into(), json!("k"));
        let value = f
            .agent
            .handle_call(&ctx(None), "get_setting", vec![], kwargs)
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn test_unknown_and_unimplemented_methods() {
        let f = fixture(MockConnection::new(LOCAL), false);
        let err = f
            .agent
            .handle_call(&ctx(None), "no_such_method", vec![], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::MethodNotFound(_)));

        let err = f
            .agent
            .handle_call(&ctx(None), "list_agent_methods", vec![], Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.detail(), "Not implemented");
    }

    #[tokio::test]
    async fn test_capability_gate_is_advisory_by_default() {
        let f = fixture(MockConnection::new(LOCAL), false);
        let value = f
            .agent
            .handle_call(&ctx(None), "start_agent", vec![json!("u1")], Map::new())
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(f.control.calls(), vec![("start_agent".to_string(), "u1".to_string())]);
    }

    #[tokio::test]
    async fn test_capability_gate_enforced() {
        let f = fixture(MockConnection::new(LOCAL), true);
        let err = f
            .agent
            .handle_call(&ctx(Some("stranger")), "stop_agent", vec![json!("u1")], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized(_)));
        assert!(f.control.calls().is_empty());

        f.credentials
            .add_capabilities("manager", &[Capability::CanManage])
            .unwrap();
        f.agent
            .handle_call(&ctx(Some("manager")), "stop_agent", vec![json!("u1")], Map::new())
            .await
            .unwrap();
        assert_eq!(f.control.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_status_returns_raw_pair() {
        let f = fixture(MockConnection::new(LOCAL), false);
        f.control
            .lifecycle
            .insert(("u1".into(), "agent_status"), ProcessStatus(Some(3), None));
        let value = f
            .agent
            .handle_call(&ctx(None), "agent_status", vec![json!("u1")], Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!([3, null]));
    }

    #[tokio::test]
    async fn test_route_request_by_name() {
        let f = fixture(MockConnection::new(LOCAL), false);
        let mut kwargs = Map::new();
        kwargs.insert("id".into(), json!("req-1"));
        kwargs.insert("method".into(), json!("status_agents"));
        kwargs.insert("params".into(), json!({}));
        let value = f
            .agent
            .handle_call(&ctx(None), "route_request", vec![], kwargs)
            .await
            .unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn test_manage_platform_returns_own_key() {
        let f = fixture(MockConnection::new(LOCAL), false);
        store_registration(
            f._home.path(),
            &CentralRegistration {
                discovery_address: "10.0.0.5:8080".into(),
                vip_address: CENTRAL_VIP.into(),
                serverkey: "central-key".into(),
            },
        )
        .unwrap();

        let value = f
            .agent
            .handle_call(
                &ctx(None),
                "manage_platform",
                vec![json!("10.0.0.5:8080"), json!("central-key")],
                Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("agent-public-key"));
        assert_eq!(
            f.credentials.capabilities("central-key"),
            vec![Capability::CanManage]
        );
        assert!(f.agent.is_managed().await);
    }

    #[tokio::test]
    async fn test_is_managed_falls_back_to_ping() {
        let f = fixture(MockConnection::new(LOCAL).unreachable_peer(CENTRAL_IDENTITY), false);
        assert!(!f.agent.is_managed().await);
        let g = fixture(MockConnection::new(LOCAL), false);
        assert!(g.agent.is_managed().await);
    }

    #[tokio::test]
    async fn test_manage_adds_manager() {
        let f = fixture(MockConnection::new(LOCAL), false);
        let value = f
            .agent
            .handle_call(
                &ctx(None),
                "manage",
                vec![json!("tcp://10.0.0.9:22916"), json!("volttron.central")],
                Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!(true));
        assert_eq!(f.agent.router().managers().managers().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_announce() {
        let f = fixture(MockConnection::new(LOCAL), false);
        f.agent.start().await;
        f.agent.stop().await;
        let published = f.local.published();
        assert_eq!(
            published,
            vec![
                (PLATFORM_TOPIC.to_string(), json!("available")),
                (PLATFORM_TOPIC.to_string(), json!("leaving")),
            ]
        );
    }

    #[tokio::test]
    async fn test_assign_platform_uuid() {
        let f = fixture(MockConnection::new(LOCAL), false);
        f.agent
            .handle_call(&ctx(None), "assign_platform_uuid", vec![json!("p1")], Map::new())
            .await
            .unwrap();
        assert_eq!(f.agent.platform_uuid().as_deref(), Some("p1"));
        f.agent.stop().await;
    }
}
