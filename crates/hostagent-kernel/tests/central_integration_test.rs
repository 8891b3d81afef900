//! Integration tests for discovery and central registration.
//!
//! An axum router on a loopback listener plays the central discovery
//! endpoint; peer connections are in-memory stubs.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use hostagent_kernel::central::{load_registration, CentralRegistrar, DiscoveryClient};
use hostagent_kernel::credentials::{AuthFile, CredentialStore};
use hostagent_types::capability::Capability;
use hostagent_types::error::PlatformError;
use hostagent_types::platform::RegistrationState;
use hostagent_wire::{PeerConnection, PeerConnectionCache, RpcTransport, WireError};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const CENTRAL_VIP: &str = "tcp://10.0.0.5:22916";
const LOCAL_VIP: &str = "tcp://127.0.0.1:22916";

// ---------------------------------------------------------------------------
// Discovery responder
// ---------------------------------------------------------------------------

struct Responder {
    address: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Responder {
    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Discovery {
    status: StatusCode,
    body: String,
    delay: Duration,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn discovery_handler(
    State(discovery): State<Discovery>,
    method: Method,
    uri: Uri,
) -> (StatusCode, [(&'static str, &'static str); 1], String) {
    discovery
        .requests
        .lock()
        .unwrap()
        .push(format!("{method} {}", uri.path()));
    tokio::time::sleep(discovery.delay).await;
    (
        discovery.status,
        [("content-type", "application/json")],
        discovery.body,
    )
}

/// Answer every request with `status` and `body` after `delay`, recording
/// method and path.
async fn serve_discovery_after(status: StatusCode, body: String, delay: Duration) -> Responder {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = axum::Router::new()
        .fallback(discovery_handler)
        .with_state(Discovery {
            status,
            body,
            delay,
            requests: requests.clone(),
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Responder { address, requests }
}

async fn serve_discovery(status: StatusCode, body: String) -> Responder {
    serve_discovery_after(status, body, Duration::ZERO).await
}

fn discovery_body() -> String {
    json!({"vip-address": CENTRAL_VIP, "serverkey": "central-key"}).to_string()
}

// ---------------------------------------------------------------------------
// In-memory peers
// ---------------------------------------------------------------------------

struct StubConnection {
    address: String,
}

#[async_trait]
impl PeerConnection for StubConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run(self: Arc<Self>) {}

    async fn ready(&self) -> Result<(), WireError> {
        Ok(())
    }

    async fn call(
        &self,
        _peer: &str,
        _method: &str,
        _args: Vec<Value>,
        _kwargs: Map<String, Value>,
    ) -> Result<Value, WireError> {
        Ok(Value::Null)
    }

    async fn publish(
        &self,
        _topic: &str,
        _headers: Map<String, Value>,
        _message: Value,
    ) -> Result<(), WireError> {
        Ok(())
    }

    async fn ping(&self, _peer: &str) -> Result<(), WireError> {
        Ok(())
    }
}

/// Opens stub connections to the listed addresses only.
struct StubTransport {
    reachable: Vec<String>,
}

impl RpcTransport for StubTransport {
    fn open(&self, address: &str) -> Result<Arc<dyn PeerConnection>, WireError> {
        if self.reachable.iter().any(|a| a == address) {
            Ok(Arc::new(StubConnection {
                address: address.to_string(),
            }))
        } else {
            Err(WireError::NotReady(address.to_string()))
        }
    }
}

fn cache(reachable: &[&str]) -> PeerConnectionCache {
    PeerConnectionCache::new(
        Arc::new(StubTransport {
            reachable: reachable.iter().map(|a| a.to_string()).collect(),
        }),
        LOCAL_VIP,
        Arc::new(StubConnection {
            address: LOCAL_VIP.to_string(),
        }),
        Duration::from_secs(1),
    )
}

fn registrar(home: &std::path::Path, discovery: Option<String>) -> (CentralRegistrar, Arc<AuthFile>) {
    let auth = Arc::new(AuthFile::in_home(home));
    let registrar =
        CentralRegistrar::new(home, discovery, Duration::from_secs(2), auth.clone()).unwrap();
    (registrar, auth)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discovery_success() {
    let responder = serve_discovery(StatusCode::OK, discovery_body()).await;
    let client = DiscoveryClient::new(Duration::from_secs(2)).unwrap();

    let info = client.discover(&responder.address).await.unwrap();
    assert_eq!(info.vip_address, CENTRAL_VIP);
    assert_eq!(info.serverkey, "central-key");
    assert_eq!(responder.requests(), vec!["GET /discovery/"]);
}

#[tokio::test]
async fn test_discovery_non_success_status() {
    let responder = serve_discovery(StatusCode::INTERNAL_SERVER_ERROR, discovery_body()).await;
    let client = DiscoveryClient::new(Duration::from_secs(2)).unwrap();
    let err = client.discover(&responder.address).await.unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));
}

#[tokio::test]
async fn test_discovery_missing_field_or_bad_json() {
    let client = DiscoveryClient::new(Duration::from_secs(2)).unwrap();

    let responder = serve_discovery(StatusCode::OK, json!({"vip-address": CENTRAL_VIP}).to_string()).await;
    let err = client.discover(&responder.address).await.unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));

    let responder = serve_discovery(StatusCode::OK, "not json".to_string()).await;
    let err = client.discover(&responder.address).await.unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));
}

#[tokio::test]
async fn test_discovery_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = DiscoveryClient::new(Duration::from_secs(2)).unwrap();
    let err = client.discover(&address).await.unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));
}

#[tokio::test]
async fn test_discovery_is_time_bounded() {
    let responder =
        serve_discovery_after(StatusCode::OK, discovery_body(), Duration::from_secs(5)).await;
    let client = DiscoveryClient::new(Duration::from_millis(200)).unwrap();

    let started = std::time::Instant::now();
    let err = client.discover(&responder.address).await.unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_manage_platform_discovers_persists_and_grants() {
    let responder = serve_discovery(StatusCode::OK, discovery_body()).await;
    let home = tempfile::tempdir().unwrap();
    let (registrar, auth) = registrar(home.path(), None);
    let cache = cache(&[CENTRAL_VIP]);

    registrar
        .manage_platform(&cache, &responder.address, "central-key")
        .await
        .unwrap();
    assert_eq!(registrar.state(), RegistrationState::Managed);

    let record = load_registration(home.path()).unwrap();
    assert_eq!(record.discovery_address, responder.address);
    assert_eq!(record.vip_address, CENTRAL_VIP);
    assert_eq!(record.serverkey, "central-key");

    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(auth.path()).unwrap()).unwrap();
    assert_eq!(
        raw["allow"],
        json!([{"credentials": "CURVE:central-key", "capabilities": ["can_manage"]}])
    );

    // Same key again: no new discovery, no duplicate entries.
    registrar
        .manage_platform(&cache, &responder.address, "central-key")
        .await
        .unwrap();
    assert_eq!(responder.requests().len(), 1);
    assert_eq!(auth.capabilities("central-key"), vec![Capability::CanManage]);

    // Different key: rejected locally.
    let err = registrar
        .manage_platform(&cache, &responder.address, "other-key")
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::AlreadyManaged(_)));
    assert!(auth.capabilities("other-key").is_empty());
}

#[tokio::test]
async fn test_unreachable_central_stays_bootstrapped() {
    let responder = serve_discovery(StatusCode::OK, discovery_body()).await;
    let home = tempfile::tempdir().unwrap();
    let (registrar, auth) = registrar(home.path(), None);
    let cache = cache(&[]);

    let err = registrar
        .manage_platform(&cache, &responder.address, "central-key")
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Unreachable(_)));
    assert_eq!(registrar.state(), RegistrationState::Bootstrapped);
    assert!(load_registration(home.path()).is_some());
    assert!(auth.capabilities("central-key").is_empty());
}

#[tokio::test]
async fn test_failed_discovery_leaves_unregistered() {
    let responder = serve_discovery(StatusCode::NOT_FOUND, String::new()).await;
    let home = tempfile::tempdir().unwrap();
    let (registrar, _auth) = registrar(home.path(), None);

    let err = registrar
        .manage_platform(&cache(&[CENTRAL_VIP]), &responder.address, "central-key")
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Discovery(_)));
    assert_eq!(registrar.state(), RegistrationState::Unregistered);
    assert!(load_registration(home.path()).is_none());
}

#[tokio::test]
async fn test_startup_registers_through_configured_discovery() {
    let responder = serve_discovery(StatusCode::OK, discovery_body()).await;
    let home = tempfile::tempdir().unwrap();
    let (registrar, auth) = registrar(home.path(), Some(responder.address.clone()));

    registrar.start(&cache(&[CENTRAL_VIP])).await;
    assert_eq!(registrar.state(), RegistrationState::Managed);
    assert_eq!(auth.capabilities("central-key"), vec![Capability::CanManage]);

    // A later process takes the fast path from the persisted record.
    let (restarted, _auth) = registrar_fresh(home.path());
    restarted.start(&cache(&[CENTRAL_VIP])).await;
    assert_eq!(restarted.state(), RegistrationState::Managed);
    assert_eq!(responder.requests().len(), 1);
}

#[tokio::test]
async fn test_mismatched_server_key_is_rejected_and_retryable() {
    let responder = serve_discovery(StatusCode::OK, discovery_body()).await;
    let home = tempfile::tempdir().unwrap();
    let (registrar, auth) = registrar(home.path(), None);
    let cache = cache(&[CENTRAL_VIP]);

    for _ in 0..2 {
        let err = registrar
            .manage_platform(&cache, &responder.address, "caller-key")
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Discovery(_)));
        assert_eq!(registrar.state(), RegistrationState::Unregistered);
    }
    assert_eq!(responder.requests().len(), 2);
    assert!(load_registration(home.path()).is_none());
    assert!(auth.capabilities("caller-key").is_empty());
    assert!(auth.capabilities("central-key").is_empty());

    // The key the central instance presents still registers afterwards.
    registrar
        .manage_platform(&cache, &responder.address, "central-key")
        .await
        .unwrap();
    assert_eq!(registrar.state(), RegistrationState::Managed);
}

fn registrar_fresh(home: &std::path::Path) -> (CentralRegistrar, Arc<AuthFile>) {
    registrar(home, None)
}
