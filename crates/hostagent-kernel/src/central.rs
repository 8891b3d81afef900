//! Registration with a central management instance.
//!
//! ```text
//! UNREGISTERED → DISCOVERING → BOOTSTRAPPED → CONNECTING → MANAGED
//!        └──────────── persisted record (fast path) ─────────┘
//! ```
//!
//! Discovery is an HTTP GET against the central instance. Its answer is
//! persisted as the registration record; after that the record never
//! changes for the life of the process.

use crate::credentials::CredentialStore;
use hostagent_types::capability::Capability;
use hostagent_types::error::{PlatformError, PlatformResult};
use hostagent_types::platform::{CentralRegistration, DiscoveryInfo, RegistrationState};
use hostagent_wire::PeerConnectionCache;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the registration record under the agent home.
pub const REGISTRATION_FILE: &str = "volttron.central";

/// HTTP client for the discovery endpoint.
pub struct DiscoveryClient {
    client: reqwest::Client,
}

impl DiscoveryClient {
    /// Every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> PlatformResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Internal(format!("cannot build discovery client: {e}")))?;
        Ok(Self { client })
    }

    /// `GET http://{discovery_address}/discovery/`.
    ///
    /// Non-2xx statuses, transport errors, bad JSON and missing fields all
    /// fail with `Discovery`.
    pub async fn discover(&self, discovery_address: &str) -> PlatformResult<DiscoveryInfo> {
        let url = format!("http://{discovery_address}/discovery/");
        debug!(url = %url, "Fetching discovery info");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PlatformError::Discovery(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PlatformError::Discovery(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        let info: DiscoveryInfo = response
            .json()
            .await
            .map_err(|e| PlatformError::Discovery(format!("invalid discovery payload: {e}")))?;

        if info.vip_address.is_empty() {
            return Err(PlatformError::Discovery("payload has no vip-address".into()));
        }
        if info.serverkey.is_empty() {
            return Err(PlatformError::Discovery("payload has no serverkey".into()));
        }
        Ok(info)
    }
}

/// Load the persisted registration record. Missing or unreadable files
/// yield `None`.
pub fn load_registration(home: &Path) -> Option<CentralRegistration> {
    let path = home.join(REGISTRATION_FILE);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(record) => {
            info!(path = %path.display(), "Central registration loaded from file");
            Some(record)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable registration record");
            None
        }
    }
}

/// Persist the registration record, overwriting any previous one.
pub fn store_registration(home: &Path, record: &CentralRegistration) -> PlatformResult<()> {
    std::fs::create_dir_all(home)?;
    std::fs::write(home.join(REGISTRATION_FILE), serde_json::to_vec(record)?)?;
    Ok(())
}

/// Whether the host part of a `tcp://host:port` address is a private,
/// loopback or link-local IP. Host names count as public.
pub fn is_ip_private(vip_address: &str) -> bool {
    let rest = vip_address.trim().trim_start_matches("tcp://");
    let rest = rest.split('?').next().unwrap_or_default();
    let host = match rest.rsplit_once(':') {
        Some((host, _port)) => host,
        None => rest,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

/// Pick the address to advertise to a central instance: the first public
/// `tcp://` address, else the last private `tcp://` address, else the first
/// address of any kind.
pub fn find_registration_address(vip_addresses: &[String]) -> Option<String> {
    let mut result: Option<&String> = None;
    for vip in vip_addresses {
        if result.is_none() {
            result = Some(vip);
        }
        if vip.starts_with("tcp://") {
            if is_ip_private(vip) {
                result = Some(vip);
            } else {
                return Some(vip.clone());
            }
        }
    }
    result.cloned()
}

/// Drives the registration state machine.
pub struct CentralRegistrar {
    home: PathBuf,
    discovery_address: Option<String>,
    discovery: DiscoveryClient,
    credentials: Arc<dyn CredentialStore>,
    state: Mutex<RegistrationState>,
    record: OnceLock<CentralRegistration>,
    /// Serializes `manage_platform` and startup registration.
    flow: tokio::sync::Mutex<()>,
}

impl CentralRegistrar {
    pub fn new(
        home: impl Into<PathBuf>,
        discovery_address: Option<String>,
        discovery_timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> PlatformResult<Self> {
        Ok(Self {
            home: home.into(),
            discovery_address: discovery_address.filter(|a| !a.is_empty()),
            discovery: DiscoveryClient::new(discovery_timeout)?,
            credentials,
            state: Mutex::new(RegistrationState::Unregistered),
            record: OnceLock::new(),
            flow: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: RegistrationState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let prev = *state;
        if prev != next {
            debug!(from = %prev, to = %next, "Registration state");
            *state = next;
        }
    }

    /// The registration record, once one is held.
    pub fn record(&self) -> Option<&CentralRegistration> {
        self.record.get()
    }

    pub fn is_registered(&self) -> bool {
        self.record.get().is_some()
    }

    /// Adopt the persisted record if none is held yet.
    fn load_record(&self) -> Option<&CentralRegistration> {
        if self.record.get().is_none() {
            if let Some(record) = load_registration(&self.home) {
                let _ = self.record.set(record);
                self.set_state(RegistrationState::Bootstrapped);
            }
        }
        self.record.get()
    }

    /// Run discovery against `discovery_address`, persist the result and
    /// hold it as the registration record.
    ///
    /// With `expected_key` set, a discovered server key that differs fails
    /// with `Discovery` and nothing is persisted.
    async fn bootstrap(
        &self,
        discovery_address: &str,
        expected_key: Option<&str>,
    ) -> PlatformResult<&CentralRegistration> {
        self.set_state(RegistrationState::Discovering);
        let info = match self.discovery.discover(discovery_address).await {
            Ok(info) => info,
            Err(e) => {
                self.set_state(RegistrationState::Unregistered);
                return Err(e);
            }
        };
        if let Some(expected) = expected_key {
            if info.serverkey != expected {
                warn!(
                    discovered = %info.serverkey,
                    supplied = expected,
                    "Discovered server key differs from the one supplied"
                );
                self.set_state(RegistrationState::Unregistered);
                return Err(PlatformError::Discovery(format!(
                    "{discovery_address} presented server key {}, expected {expected}",
                    info.serverkey
                )));
            }
        }

        let record = CentralRegistration::from_discovery(discovery_address, info);
        if let Err(e) = store_registration(&self.home, &record) {
            self.set_state(RegistrationState::Unregistered);
            return Err(e);
        }
        info!(
            discovery_address,
            vip_address = %record.vip_address,
            "Central registration bootstrapped"
        );
        let _ = self.record.set(record);
        self.set_state(RegistrationState::Bootstrapped);
        self.record
            .get()
            .ok_or_else(|| PlatformError::Internal("registration record not set".into()))
    }

    /// Dial the central instance and grant its key `can_manage`.
    ///
    /// A failed dial leaves the machine in BOOTSTRAPPED so it can be
    /// retried.
    async fn connect(&self, cache: &PeerConnectionCache, central_key: &str) -> PlatformResult<()> {
        let record = self
            .record
            .get()
            .ok_or_else(|| PlatformError::CannotConnect("no central registration".into()))?;

        self.set_state(RegistrationState::Connecting);
        if let Err(e) = cache.acquire(&record.vip_address).await {
            warn!(address = %record.vip_address, error = %e, "Could not connect to central");
            self.set_state(RegistrationState::Bootstrapped);
            return Err(e.into());
        }

        if let Err(e) = self
            .credentials
            .add_capabilities(central_key, &[Capability::CanManage])
        {
            self.set_state(RegistrationState::Bootstrapped);
            return Err(e);
        }
        self.set_state(RegistrationState::Managed);
        info!(address = %record.vip_address, "Platform is managed");
        Ok(())
    }

    /// Handle a `manage_platform(uri, vc_publickey)` request.
    ///
    /// A held record with a different server key fails with
    /// `AlreadyManaged`. The same key again skips discovery and re-runs the
    /// connect step. Without a record, discovery must present `central_key`.
    pub async fn manage_platform(
        &self,
        cache: &PeerConnectionCache,
        uri: &str,
        central_key: &str,
    ) -> PlatformResult<()> {
        let _flow = self.flow.lock().await;
        info!(uri, "Request to manage platform");

        match self.load_record() {
            Some(record) => {
                if record.serverkey != central_key {
                    return Err(PlatformError::AlreadyManaged(format!(
                        "attempted to register with different key: {central_key}"
                    )));
                }
                info!(serverkey = %record.serverkey, "Already registered");
            }
            None => {
                self.bootstrap(uri, Some(central_key)).await?;
            }
        }

        self.connect(cache, central_key).await
    }

    /// Startup registration: the persisted record takes the fast path,
    /// otherwise a configured discovery address is used, otherwise nothing
    /// happens. Failures are logged, never fatal.
    pub async fn start(&self, cache: &PeerConnectionCache) {
        let _flow = self.flow.lock().await;
        if let Some(record) = self.load_record() {
            let key = record.serverkey.clone();
            if let Err(e) = self.connect(cache, &key).await {
                warn!(error = %e, "Fast-path reconnect to central failed");
            }
            return;
        }
        if self.discovery_address.is_none() {
            info!("No central instance configured");
            return;
        }
        if let Err(e) = self.register(cache).await {
            warn!(error = %e, "Registration with central failed");
        }
    }

    /// Register through the configured discovery address.
    pub async fn register_with_central(&self, cache: &PeerConnectionCache) -> PlatformResult<()> {
        let _flow = self.flow.lock().await;
        self.register(cache).await
    }

    async fn register(&self, cache: &PeerConnectionCache) -> PlatformResult<()> {
        if self.record.get().is_some() {
            return Err(PlatformError::AlreadyManaged(
                "a central registration is already held".into(),
            ));
        }
        let Some(address) = self.discovery_address.clone() else {
            return Err(PlatformError::CannotConnect("invalid discovery address".into()));
        };
        let key = self.bootstrap(&address, None).await?.serverkey.clone();
        self.connect(cache, &key).await
    }
}
