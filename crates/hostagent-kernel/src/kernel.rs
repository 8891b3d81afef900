//! HostKernel: assembles the node, the local connection and the platform
//! agent, and runs them until shutdown.

use crate::central::CentralRegistrar;
use crate::control::RpcControlService;
use crate::credentials::{AuthFile, CredentialStore};
use crate::error::{KernelError, KernelResult};
use crate::keystore::AgentKeys;
use crate::platform::PlatformAgent;
use crate::router::{PlatformRouter, RouterTimeouts};
use crate::settings::SettingsStore;
use hostagent_types::config::PlatformConfig;
use hostagent_wire::client::parse_address;
use hostagent_wire::{
    ClientConfig, NodeConfig, PeerConnection, PeerConnectionCache, PeerNode, TcpConnection,
    TcpTransport,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

fn key_prefix(public_key: &str) -> &str {
    public_key.get(..8).unwrap_or(public_key)
}

/// A running host agent.
pub struct HostKernel {
    node: Arc<PeerNode>,
    local: Arc<TcpConnection>,
    agent: Arc<PlatformAgent>,
    node_task: JoinHandle<()>,
    local_task: JoinHandle<()>,
}

impl HostKernel {
    /// Boot in order: keys, node, local connection, router and agent,
    /// then startup registration.
    pub async fn boot(config: PlatformConfig) -> KernelResult<Self> {
        let home = config.home();
        std::fs::create_dir_all(&home).map_err(|e| {
            KernelError::BootFailed(format!("cannot create home {}: {e}", home.display()))
        })?;
        let keys = AgentKeys::load_or_create(&home)?;

        let socket = parse_address(&config.vip_address)?;
        let listen_addr = tokio::net::lookup_host(&socket)
            .await
            .map_err(|e| KernelError::BootFailed(format!("cannot resolve {socket}: {e}")))?
            .next()
            .ok_or_else(|| KernelError::BootFailed(format!("{socket} resolved to nothing")))?;

        let node = PeerNode::bind(NodeConfig {
            listen_addr,
            identity: config.identity.clone(),
            shared_secret: config.network.shared_secret.clone(),
            forward_timeout: config.timeouts.rpc(),
        })
        .await?;
        let vip_address = node.vip_address();

        // Stable per-host identity for outbound connections.
        let transport = TcpTransport::new(ClientConfig {
            identity: format!("{}.{}", config.identity, key_prefix(&keys.public)),
            unique_suffix: false,
            public_key: keys.public.clone(),
            shared_secret: config.network.shared_secret.clone(),
        });
        let local = transport.connect(&vip_address)?;
        let local_dyn: Arc<dyn PeerConnection> = local.clone();
        let cache = Arc::new(PeerConnectionCache::new(
            Arc::new(transport),
            vip_address.clone(),
            Arc::clone(&local_dyn),
            config.timeouts.connect(),
        ));

        let credentials: Arc<dyn CredentialStore> = Arc::new(AuthFile::in_home(&home));
        let control = Arc::new(RpcControlService::new(
            Arc::clone(&local_dyn),
            config.control_identity.clone(),
            config.timeouts.rpc(),
        ));
        let registrar = CentralRegistrar::new(
            &home,
            config.discovery_address.clone(),
            config.timeouts.discovery(),
            Arc::clone(&credentials),
        )?;
        let router = Arc::new(PlatformRouter::new(
            cache,
            registrar,
            SettingsStore::in_home(&home),
            control,
            RouterTimeouts::from(&config.timeouts),
        ));
        let agent = Arc::new(PlatformAgent::new(
            &config,
            router,
            credentials,
            keys.public.clone(),
            vec![vip_address.clone()],
        ));

        let node_task = node.serve(agent.clone())?;
        let local_task = tokio::spawn(Arc::clone(&local_dyn).run());
        match tokio::time::timeout(config.timeouts.connect(), local.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                node_task.abort();
                local_task.abort();
                return Err(KernelError::BootFailed(format!("local connection failed: {e}")));
            }
            Err(_) => {
                node_task.abort();
                local_task.abort();
                return Err(KernelError::BootFailed(format!(
                    "local connection not ready within {}s",
                    config.timeouts.connect_secs
                )));
            }
        }

        agent.start().await;
        info!(
            vip_address = %vip_address,
            identity = %config.identity,
            public_key = %keys.public,
            "Host agent running"
        );

        Ok(Self {
            node,
            local,
            agent,
            node_task,
            local_task,
        })
    }

    pub fn agent(&self) -> &Arc<PlatformAgent> {
        &self.agent
    }

    pub fn node(&self) -> &Arc<PeerNode> {
        &self.node
    }

    /// The bound `tcp://host:port` address.
    pub fn vip_address(&self) -> String {
        self.node.vip_address()
    }

    /// Announce departure, stop background loops and close the node.
    pub async fn shutdown(self) {
        self.agent.stop().await;
        self.local.shutdown();
        self.local_task.abort();
        self.node_task.abort();
        info!("Host agent shut down");
    }
}
