//! Health and degradation controller.
//!
//! The transport is probed once at open time. After that the controller only
//! reacts to the transport's degraded flag: while it is set, containers are
//! polled over shell-exec at a fixed interval and fed to the monitor, and the
//! API tunnel is re-probed on each tick.
//!
//! ```text
//!   watching ──degraded──► polling ──tunnel answers──► watching
//!                            │  ▲
//!                            └──┘ tick: list via shell-exec, diff, re-probe
//! ```

use std::sync::Arc;

use dockwarden_core::{NodeId, Notification, NotificationKind};
use dockwarden_transport::NodeTransport;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::HealthConfig;
use crate::monitor::StateMonitor;

/// Watches one node's transport for degradation.
pub struct HealthController {
    node_id: NodeId,
    node_name: String,
    transport: Arc<NodeTransport>,
    config: HealthConfig,
    monitor: Arc<StateMonitor>,
    bus: Arc<EventBus<Notification>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthController {
    /// Create a controller; call [`HealthController::start`] to begin watching.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        node_name: impl Into<String>,
        transport: Arc<NodeTransport>,
        config: HealthConfig,
        monitor: Arc<StateMonitor>,
        bus: Arc<EventBus<Notification>>,
    ) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            transport,
            config,
            monitor,
            bus,
            task: Mutex::new(None),
        }
    }

    /// Spawn the watch task. Calling it again replaces the previous task.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run(&self) {
        let mut degraded = self.transport.subscribe_degraded();
        loop {
            if degraded.wait_for(|d| *d).await.is_err() {
                return;
            }
            warn!(
                node_id = %self.node_id,
                poll_secs = self.config.fallback_poll_secs,
                "Engine API unavailable, using shell-exec fallback"
            );
            self.bus.publish(
                &Notification::node(NotificationKind::NodeDegraded, self.node_id.clone(), &self.node_name)
                    .with_attribute("transport_mode", self.transport.mode().as_str()),
            );

            self.poll_until_recovered().await;

            info!(node_id = %self.node_id, "Engine API tunnel recovered");
            self.bus.publish(
                &Notification::node(NotificationKind::NodeRecovered, self.node_id.clone(), &self.node_name)
                    .with_attribute("transport_mode", self.transport.mode().as_str()),
            );
        }
    }

    async fn poll_until_recovered(&self) {
        let mut ticker = tokio::time::interval(self.config.fallback_poll());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and only refreshes states.
        ticker.tick().await;
        self.poll_once().await;

        loop {
            ticker.tick().await;
            self.poll_once().await;
            if self.transport.try_restore_api().await {
                return;
            }
        }
    }

    async fn poll_once(&self) {
        match self.transport.list_containers_via_shell(true).await {
            Ok(snapshot) => {
                debug!(node_id = %self.node_id, containers = snapshot.len(), "Fallback poll");
                self.monitor.handle_snapshot(&snapshot);
            }
            Err(e) => warn!(node_id = %self.node_id, error = %e, "Fallback poll failed"),
        }
    }

    /// Stop watching.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HealthController {
    fn drop(&mut self) {
        self.stop();
    }
}
