//! Periodic work: sibling refresh and per-platform agent/status publishing.
//!
//! Every loop waits on `sleep` against the shared shutdown signal and exits
//! as soon as shutdown is requested.

use crate::router::PlatformRouter;
use dashmap::DashMap;
use hostagent_types::config::ScheduleConfig;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SIBLING_TASK: &str = "sibling-refresh";
const PLATFORM_TASK: &str = "platform-publish";

/// Topic carrying the agent listing of platform `uuid`.
pub fn agents_topic(uuid: &str) -> String {
    format!("platforms/{uuid}/agents")
}

/// Topic carrying the status summary of platform `uuid`.
pub fn status_topic(uuid: &str) -> String {
    format!("platforms/{uuid}/status")
}

/// Owns the background loops and the shutdown signal they observe.
pub struct BackgroundTasks {
    tasks: DashMap<&'static str, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    schedule: ScheduleConfig,
}

impl BackgroundTasks {
    pub fn new(schedule: ScheduleConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            tasks: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            schedule,
        }
    }

    /// Get a receiver that is notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Number of loops currently held.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    fn insert(&self, name: &'static str, handle: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(name, handle) {
            previous.abort();
            debug!(task = name, "Replaced background loop");
        }
    }

    /// Refresh every manager's sibling list on the configured interval.
    /// A zero interval disables the loop.
    pub fn start_sibling_refresh(&self, router: Arc<PlatformRouter>) {
        let secs = self.schedule.sibling_refresh_secs;
        if secs == 0 {
            debug!("Sibling refresh disabled");
            return;
        }
        let interval = Duration::from_secs(secs);
        let mut shutdown = self.shutdown_rx.clone();
        info!(interval_secs = secs, "Starting sibling refresh loop");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        debug!("Sibling refresh: shutdown signal received");
                        break;
                    }
                }
                router.refresh_siblings().await;
            }
        });
        self.insert(SIBLING_TASK, handle);
    }

    /// Publish the agent listing and status summary of `uuid` on the local
    /// connection every interval. A later call replaces the running loop.
    pub fn start_platform_publisher(&self, router: Arc<PlatformRouter>, uuid: String) {
        let secs = self.schedule.platform_publish_secs;
        if secs == 0 {
            debug!("Platform publishing disabled");
            return;
        }
        let interval = Duration::from_secs(secs);
        let mut shutdown = self.shutdown_rx.clone();
        info!(platform_uuid = %uuid, interval_secs = secs, "Starting platform publisher");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        debug!(platform_uuid = %uuid, "Platform publisher: shutdown signal received");
                        break;
                    }
                }
                publish_platform(&router, &uuid).await;
            }
        });
        self.insert(PLATFORM_TASK, handle);
    }

    /// Signal every loop to stop and drop their handles.
    pub fn shutdown(&self) {
        info!("Stopping background loops");
        let _ = self.shutdown_tx.send(true);
        self.tasks.clear();
    }
}

/// One tick of the platform publisher.
pub async fn publish_platform(router: &PlatformRouter, uuid: &str) {
    let local = router.cache().local();

    match router.list_agents().await {
        Ok(agents) => match serde_json::to_value(agents) {
            Ok(message) => {
                if let Err(e) = local.publish(&agents_topic(uuid), Map::new(), message).await {
                    warn!(error = %e, "Could not publish agent list");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode agent list"),
        },
        Err(e) => warn!(error = %e, "Could not list agents for publishing"),
    }

    match router.status_agents().await {
        Ok(statuses) => match serde_json::to_value(statuses) {
            Ok(message) => {
                if let Err(e) = local.publish(&status_topic(uuid), Map::new(), message).await {
                    warn!(error = %e, "Could not publish status list");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode status list"),
        },
        Err(e) => warn!(error = %e, "Could not list agent status for publishing"),
    }
}
