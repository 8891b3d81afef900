//! In-memory doubles for the transport and control collaborators.

use crate::control::{ControlService, LifecycleOp};
use crate::credentials::CredentialStore;
use async_trait::async_trait;
use dashmap::DashMap;
use hostagent_types::agent::{AgentRecord, AgentStatusRecord, ProcessStatus};
use hostagent_types::capability::Capability;
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_wire::{PeerConnection, RpcTransport, WireError};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub peer: String,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

enum Reply {
    Value(Value),
    Error(i32, String),
    Hang,
}

/// Connection double answering from a table keyed by `peer.method`.
pub struct MockConnection {
    address: String,
    replies: DashMap<String, Reply>,
    unreachable: HashSet<String>,
    fail_publish: bool,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub published: Mutex<Vec<(String, Value)>>,
}

impl MockConnection {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            replies: DashMap::new(),
            unreachable: HashSet::new(),
            fail_publish: false,
            calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, peer: &str, method: &str, value: Value) -> Self {
        self.replies.insert(format!("{peer}.{method}"), Reply::Value(value));
        self
    }

    pub fn fail(self, peer: &str, method: &str, code: i32, message: &str) -> Self {
        self.replies
            .insert(format!("{peer}.{method}"), Reply::Error(code, message.to_string()));
        self
    }

    pub fn hang(self, peer: &str, method: &str) -> Self {
        self.replies.insert(format!("{peer}.{method}"), Reply::Hang);
        self
    }

    pub fn unreachable_peer(mut self, peer: &str) -> Self {
        self.unreachable.insert(peer.to_string());
        self
    }

    pub fn failing_publish(mut self) -> Self {
        self.fail_publish = true;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(self: Arc<Self>) {}

    async fn ready(&self) -> Result<(), WireError> {
        Ok(())
    }

    async fn call(
        &self,
        peer: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WireError> {
        self.calls.lock().unwrap().push(RecordedCall {
            peer: peer.to_string(),
            method: method.to_string(),
            args,
            kwargs,
        });
        let hang = match self.replies.get(&format!("{peer}.{method}")).as_deref() {
            Some(Reply::Value(v)) => return Ok(v.clone()),
            Some(Reply::Error(code, message)) => {
                return Err(WireError::Remote {
                    code: *code,
                    message: message.clone(),
                })
            }
            Some(Reply::Hang) => true,
            None => false,
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Err(WireError::Remote {
            code: hostagent_types::error::METHOD_NOT_FOUND,
            message: format!("{peer}.{method}"),
        })
    }

    async fn publish(
        &self,
        topic: &str,
        _headers: Map<String, Value>,
        message: Value,
    ) -> Result<(), WireError> {
        if self.fail_publish {
            return Err(WireError::ConnectionClosed);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), message));
        Ok(())
    }

    async fn ping(&self, peer: &str) -> Result<(), WireError> {
        if self.unreachable.contains(peer) {
            Err(WireError::Remote {
                code: hostagent_types::error::UNREACHABLE,
                message: peer.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Transport double handing out pre-registered connections. Unknown
/// addresses fail to open.
#[derive(Default)]
pub struct MockTransport {
    peers: DashMap<String, Arc<MockConnection>>,
}

impl MockTransport {
    pub fn with_peer(self, conn: MockConnection) -> Self {
        self.peers.insert(conn.address.clone(), Arc::new(conn));
        self
    }

    pub fn peer(&self, address: &str) -> Arc<MockConnection> {
        Arc::clone(self.peers.get(address).unwrap().value())
    }
}

impl RpcTransport for MockTransport {
    fn open(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError> {
        match self.peers.get(address) {
            Some(conn) => {
                let conn: Arc<dyn PeerConnection> = Arc::clone(conn.value()) as Arc<dyn PeerConnection>;
                Ok(conn)
            }
            None => Err(WireError::NotReady(address.to_string())),
        }
    }
}

/// Control service double with canned inventory and status.
#[derive(Default)]
pub struct MockControl {
    pub agents: Vec<AgentRecord>,
    pub statuses: Vec<AgentStatusRecord>,
    pub lifecycle: DashMap<(String, &'static str), ProcessStatus>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub installed: Mutex<Vec<(String, Vec<u8>)>>,
    pub send_delay: Option<Duration>,
}

impl MockControl {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlService for MockControl {
    async fn list_agents(&self) -> PlatformResult<Vec<AgentRecord>> {
        Ok(self.agents.clone())
    }

    async fn status_agents(&self) -> PlatformResult<Vec<AgentStatusRecord>> {
        Ok(self.statuses.clone())
    }

    async fn lifecycle(&self, op: LifecycleOp, uuid: &str) -> PlatformResult<Option<ProcessStatus>> {
        self.calls
            .lock()
            .unwrap()
            .push((op.method().to_string(), uuid.to_string()));
        Ok(self
            .lifecycle
            .get(&(uuid.to_string(), op.method()))
            .map(|s| *s.value()))
    }

    async fn send_agent(&self, path: &Path, timeout: Duration) -> PlatformResult<String> {
        if let Some(delay) = self.send_delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay)).await.is_err() {
                return Err(PlatformError::Unreachable("send_agent timed out".into()));
            }
        }
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut installed = self.installed.lock().unwrap();
        installed.push((name, bytes));
        Ok(format!("uuid-{}", installed.len()))
    }
}

/// Allow-list double.
#[derive(Default)]
pub struct MemoryCredentials {
    pub entries: DashMap<String, Vec<Capability>>,
}

impl CredentialStore for MemoryCredentials {
    fn add_capabilities(&self, public_key: &str, capabilities: &[Capability]) -> PlatformResult<()> {
        let mut entry = self.entries.entry(public_key.to_string()).or_default();
        for cap in capabilities {
            if !entry.contains(cap) {
                entry.push(cap.clone());
            }
        }
        Ok(())
    }

    fn capabilities(&self, public_key: &str) -> Vec<Capability> {
        self.entries
            .get(public_key)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
