//! Per-node connection management.
//!
//! A [`NodeConnection`] owns everything that exists for one node while it is
//! connected: the transport, the event ingestor, the health controller and
//! the state monitor. Those are created together on connect and torn down
//! together on disconnect or session loss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dockwarden_core::{
    CanonicalEvent, ContainerDetails, ContainerSnapshot, Credential, ExecOutput, ImageSummary,
    NetworkSummary, NodeDescriptor, NodeId, Notification, NotificationKind, VolumeSummary,
};
use dockwarden_transport::{CommandOutput, Connector, ExecOptions, NodeTransport, TransportMode};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::health::HealthController;
use crate::ingest::EventIngestor;
use crate::lifecycle::{can_connect, validate_transition};
use crate::monitor::StateMonitor;
use crate::recreate::{self, RecreateOptions, RecreateResult};
use crate::reconnect::ReconnectManager;
use crate::state::KnownStates;
use crate::types::{ConnectionState, ConnectionStatus};

/// Components that live for one connected session.
struct Session {
    transport: Arc<NodeTransport>,
    monitor: Arc<StateMonitor>,
    ingestor: Arc<EventIngestor>,
    health: Arc<HealthController>,
    watcher: Option<JoinHandle<()>>,
}

impl Session {
    /// Stop background work. The caller closes the transport.
    fn shutdown(&mut self, abort_watcher: bool) {
        self.ingestor.stop();
        self.health.stop();
        self.monitor.stop();
        match self.watcher.take() {
            Some(watcher) if abort_watcher => watcher.abort(),
            _ => {}
        }
    }
}

/// Connection to one managed node.
pub struct NodeConnection {
    descriptor: NodeDescriptor,
    credential: Credential,
    config: NodeConfig,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus<Notification>>,
    raw_bus: Arc<EventBus<CanonicalEvent>>,
    known: Arc<KnownStates>,
    status: watch::Sender<ConnectionStatus>,
    reconnect: Mutex<ReconnectManager>,
    session: Mutex<Option<Session>>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    this: Weak<Self>,
}

impl NodeConnection {
    /// Create a disconnected node publishing to the given buses.
    #[must_use]
    pub fn new(
        descriptor: NodeDescriptor,
        credential: Credential,
        config: NodeConfig,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus<Notification>>,
        raw_bus: Arc<EventBus<CanonicalEvent>>,
    ) -> Arc<Self> {
        let reconnect = ReconnectManager::new(config.reconnect.clone());
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new_cyclic(|this| Self {
            descriptor,
            credential,
            config,
            connector,
            bus,
            raw_bus,
            known: Arc::new(KnownStates::new()),
            status,
            reconnect: Mutex::new(reconnect),
            session: Mutex::new(None),
            connect_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Node ID.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.descriptor.id
    }

    /// Static node description.
    #[must_use]
    pub const fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let (transport_mode, degraded) = self
            .session
            .lock()
            .as_ref()
            .map_or((TransportMode::Unknown, false), |s| {
                (s.transport.mode(), s.transport.is_degraded())
            });
        ConnectionState {
            status: self.status(),
            transport_mode,
            degraded,
            reconnect_attempts: self.reconnect.lock().attempts(),
        }
    }

    /// Apply a status change if the lifecycle allows it.
    fn transition(&self, to: ConnectionStatus) -> bool {
        let mut outcome = None;
        let changed = self.status.send_if_modified(|status| {
            match validate_transition(&self.descriptor.id, *status, to) {
                Ok(next) => {
                    outcome = Some(Ok(*status));
                    *status = next;
                    true
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });
        match outcome {
            Some(Ok(from)) => debug!(node_id = %self.descriptor.id, %from, %to, "Status changed"),
            Some(Err(e)) => debug!(error = %e, "Status change skipped"),
            None => {}
        }
        changed
    }

    /// Connect to the node, retrying until it succeeds or the node is
    /// disconnected.
    ///
    /// Calls made while an attempt is in flight wait for that attempt.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the node is disconnected before a connection
    /// is established.
    pub async fn connect(&self) -> Result<()> {
        let mut status = self.status.subscribe();
        let started = self.status.send_if_modified(|s| {
            if can_connect(*s) {
                *s = ConnectionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if started {
            info!(node_id = %self.descriptor.id, host = %self.descriptor.address.host, "Connecting");
            self.spawn_connect_loop();
        }

        let outcome = *status
            .wait_for(|s| *s != ConnectionStatus::Connecting)
            .await
            .map_err(|_| NodeError::Internal("status channel closed".into()))?;
        match outcome {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(NodeError::Cancelled(self.descriptor.id.clone())),
        }
    }

    fn spawn_connect_loop(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(Self::connect_loop(self.this.clone(), generation));
        if let Some(previous) = self.connect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn connect_loop(this: Weak<Self>, generation: u64) {
        loop {
            let Some(node) = this.upgrade() else {
                return;
            };
            if node.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match node.connector.open(&node.descriptor, &node.credential).await {
                Ok(transport) => {
                    if node.generation.load(Ordering::SeqCst) != generation {
                        transport.close().await;
                        return;
                    }
                    node.reconnect.lock().reset();
                    node.on_connected(transport, generation);
                    return;
                }
                Err(e) => {
                    let (delay, attempt, fast) = {
                        let mut reconnect = node.reconnect.lock();
                        let delay = reconnect.record_failure();
                        (delay, reconnect.attempts(), reconnect.in_fast_phase())
                    };
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    if e.is_auth() {
                        error!(node_id = %node.descriptor.id, attempt, delay_ms, error = %e, "Authentication failed");
                    } else if fast {
                        warn!(node_id = %node.descriptor.id, attempt, delay_ms, error = %e, "Connect failed, retrying");
                    } else {
                        debug!(node_id = %node.descriptor.id, attempt, delay_ms, error = %e, "Connect failed, retrying");
                    }
                    drop(node);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn on_connected(&self, transport: Arc<NodeTransport>, generation: u64) {
        let id = self.descriptor.id.clone();
        let name = self.descriptor.name.clone();

        let monitor = Arc::new(StateMonitor::new(
            id.clone(),
            name.clone(),
            self.config.monitor.clone(),
            Arc::clone(&self.known),
            Arc::clone(&self.bus),
        ));
        let ingestor = Arc::new(EventIngestor::new(
            id.clone(),
            Arc::clone(&transport),
            self.config.ingest.clone(),
            Arc::clone(&self.known),
            Arc::clone(&self.raw_bus),
            Arc::clone(&monitor),
        ));
        let health = Arc::new(HealthController::new(
            id.clone(),
            name.clone(),
            Arc::clone(&transport),
            self.config.health.clone(),
            Arc::clone(&monitor),
            Arc::clone(&self.bus),
        ));
        let watcher = tokio::spawn(Self::watch_session(
            self.this.clone(),
            Arc::clone(&transport),
            generation,
        ));

        let mode = transport.mode();
        *self.session.lock() = Some(Session {
            transport,
            monitor,
            ingestor: Arc::clone(&ingestor),
            health: Arc::clone(&health),
            watcher: Some(watcher),
        });
        self.transition(ConnectionStatus::Connected);

        info!(node_id = %id, mode = %mode, "Node online");
        self.bus.publish(
            &Notification::node(NotificationKind::NodeOnline, id, name)
                .with_attribute("transport_mode", mode.as_str()),
        );

        ingestor.start();
        health.start();
    }

    async fn watch_session(this: Weak<Self>, transport: Arc<NodeTransport>, generation: u64) {
        transport.session_closed().await;
        drop(transport);
        if let Some(node) = this.upgrade() {
            node.on_session_lost(generation).await;
        }
    }

    async fn on_session_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if !self.transition(ConnectionStatus::Error) {
            return;
        }
        warn!(node_id = %self.descriptor.id, "Session lost, reconnecting");

        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.shutdown(false);
            session.transport.close().await;
        }
        // A disconnect during teardown owns the node from here on.
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(node_id = %self.descriptor.id, "Disconnected during teardown, not reconnecting");
            return;
        }
        self.bus.publish(
            &Notification::node(
                NotificationKind::NodeOffline,
                self.descriptor.id.clone(),
                &self.descriptor.name,
            )
            .with_attribute("reason", "session_lost"),
        );

        if self.generation.load(Ordering::SeqCst) == generation
            && self.transition(ConnectionStatus::Connecting)
        {
            self.spawn_connect_loop();
        }
    }

    /// Tear down the session and stop reconnecting.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }
        // Error only occurs while a lost session is being torn down.
        let was_connected = matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::Error
        );
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.shutdown(true);
            session.transport.close().await;
        }
        self.transition(ConnectionStatus::Disconnected);

        if was_connected {
            info!(node_id = %self.descriptor.id, "Node offline");
            self.bus.publish(
                &Notification::node(
                    NotificationKind::NodeOffline,
                    self.descriptor.id.clone(),
                    &self.descriptor.name,
                )
                .with_attribute("reason", "disconnect"),
            );
        }
    }

    /// Disconnect, then connect again.
    ///
    /// # Errors
    ///
    /// See [`NodeConnection::connect`].
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// The open transport.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if the node has no session.
    pub fn transport(&self) -> Result<Arc<NodeTransport>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.transport))
            .ok_or_else(|| NodeError::NotConnected(self.descriptor.id.clone()))
    }

    /// Register a callback for this node's notifications.
    pub fn on_event(&self, callback: impl Fn(&Notification) + Send + Sync + 'static) -> Subscription {
        let id = self.descriptor.id.clone();
        self.bus.subscribe(move |n: &Notification| {
            if n.node_id == id {
                callback(n);
            }
        })
    }

    /// Register a callback for this node's canonical events, before debounce.
    pub fn on_raw_event(&self, callback: impl Fn(&CanonicalEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.descriptor.id.clone();
        self.raw_bus.subscribe(move |e: &CanonicalEvent| {
            if e.node_id == id {
                callback(e);
            }
        })
    }

    /// List containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        Ok(self.transport()?.list_containers(all).await?)
    }

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn start_container(&self, container: &str) -> Result<()> {
        Ok(self.transport()?.start(container).await?)
    }

    /// Stop a container with the configured grace period.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn stop_container(&self, container: &str) -> Result<()> {
        let grace = self.config.recreate.stop_timeout();
        Ok(self.transport()?.stop(container, grace).await?)
    }

    /// Restart a container with the configured grace period.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn restart_container(&self, container: &str) -> Result<()> {
        let grace = self.config.recreate.stop_timeout();
        Ok(self.transport()?.restart(container, grace).await?)
    }

    /// Run a command inside a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn exec_in_container(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        Ok(self.transport()?.exec(container, cmd).await?)
    }

    /// Fetch container logs, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String> {
        Ok(self.transport()?.logs(container, tail).await?)
    }

    /// Inspect a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        Ok(self.transport()?.inspect(container).await?)
    }

    /// List images.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.transport()?.list_images().await?)
    }

    /// List networks.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        Ok(self.transport()?.list_networks().await?)
    }

    /// List volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the engine call fails.
    pub async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        Ok(self.transport()?.list_volumes().await?)
    }

    /// Recreate a container with the given overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected, the container cannot
    /// be inspected, or a requested pull fails. Later failures are reported
    /// in the result.
    pub async fn recreate(&self, container: &str, options: &RecreateOptions) -> Result<RecreateResult> {
        let transport = self.transport()?;
        recreate::recreate(
            &transport,
            container,
            options,
            self.config.recreate.stop_timeout(),
        )
        .await
    }

    /// Run a shell command on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected or the command fails.
    pub async fn execute(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput> {
        Ok(self.transport()?.execute(command, options).await?)
    }

    /// Time until the next connect attempt after `attempt` failures.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.reconnect.lock().delay_for(attempt)
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.get_mut().take() {
            task.abort();
        }
        if let Some(mut session) = self.session.get_mut().take() {
            session.shutdown(true);
        }
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("id", &self.descriptor.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockwarden_core::ContainerState;
    use dockwarden_transport::mock::{MockConnector, MockEngine};

    fn node(connector: Arc<MockConnector>) -> (Arc<NodeConnection>, Arc<EventBus<Notification>>) {
        let bus = EventBus::new();
        let node = NodeConnection::new(
            NodeDescriptor::new(NodeId::new("n1").unwrap(), "Node 1", "10.0.0.1", "ops"),
            Credential::password("secret"),
            NodeConfig::default(),
            connector,
            Arc::clone(&bus),
            EventBus::new(),
        );
        (node, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_connection() {
        let engine = MockEngine::new();
        let (node, _) = node(Arc::new(MockConnector::new(&engine)));
        assert!(matches!(
            node.list_containers(true).await,
            Err(NodeError::NotConnected(_))
        ));
        assert_eq!(node.state().transport_mode, TransportMode::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_operate() {
        let engine = MockEngine::new();
        engine.add_container("web", "nginx", ContainerState::Running);
        let (node, _) = node(Arc::new(MockConnector::new(&engine)));

        node.connect().await.unwrap();
        let state = node.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.transport_mode, TransportMode::ApiTunnel);
        assert!(!state.degraded);

        node.stop_container("web").await.unwrap();
        assert_eq!(engine.container("web").unwrap().state, ContainerState::Stopped);
        node.start_container("web").await.unwrap();
        node.restart_container("web").await.unwrap();

        let out = node
            .exec_in_container("web", &["echo".to_string(), "hi".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "echo hi\n");

        engine.set_logs("web", "a\nb\nc\n");
        assert_eq!(node.logs("web", Some(2)).await.unwrap(), "b\nc\n");
        assert_eq!(node.inspect("web").await.unwrap().image, "nginx");
        assert_eq!(node.list_images().await.unwrap().len(), 1);
        assert!(node.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn on_event_filters_by_node() {
        let engine = MockEngine::new();
        let (node, bus) = node(Arc::new(MockConnector::new(&engine)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = node.on_event(move |n| sink.lock().push(n.kind));

        bus.publish(&Notification::node(
            NotificationKind::NodeOnline,
            NodeId::new("other").unwrap(),
            "Other",
        ));
        bus.publish(&Notification::node(
            NotificationKind::NodeOnline,
            NodeId::new("n1").unwrap(),
            "Node 1",
        ));
        assert_eq!(*seen.lock(), vec![NotificationKind::NodeOnline]);

        sub.unsubscribe();
        bus.publish(&Notification::node(
            NotificationKind::NodeOffline,
            NodeId::new("n1").unwrap(),
            "Node 1",
        ));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_cancels_waiters() {
        let engine = MockEngine::new();
        let connector = Arc::new(MockConnector::new(&engine));
        connector.fail_times(100);
        let (node, _) = node(Arc::clone(&connector));

        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.connect().await })
        };
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(node.status(), ConnectionStatus::Connecting);

        node.disconnect().await;
        assert!(matches!(waiter.await.unwrap(), Err(NodeError::Cancelled(_))));
        assert_eq!(node.status(), ConnectionStatus::Disconnected);

        let attempts = connector.attempts();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), attempts);
    }
}
