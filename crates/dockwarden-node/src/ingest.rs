//! Event ingestor.
//!
//! Reads the engine's event feed for one node, turns each JSON line into a
//! [`CanonicalEvent`], drops duplicates and hands the rest to the monitor.
//! A terminated feed is reopened after a fixed delay until the ingestor is
//! stopped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dockwarden_core::{CanonicalEvent, ContainerId, NodeId};
use dockwarden_transport::framing::LineBuffer;
use dockwarden_transport::{ByteStream, EventFilter, NodeTransport, StreamCancel, StreamOpen};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::bus::EventBus;
use crate::config::IngestConfig;
use crate::monitor::StateMonitor;
use crate::state::KnownStates;

/// An event record as the engine emits it, from the API stream and from
/// `events --format '{{json .}}'` alike.
#[derive(Debug, Deserialize)]
struct EngineEvent {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: EngineActor,
    #[serde(rename = "timeNano", default)]
    time_nano: i64,
}

#[derive(Debug, Deserialize)]
struct EngineActor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Parse one engine event line.
///
/// Returns `None` for non-container records, actions outside the allow-list,
/// and records without a container ID or name.
#[must_use]
pub fn parse_event(node_id: &NodeId, line: &str) -> Option<CanonicalEvent> {
    let record: EngineEvent = serde_json::from_str(line.trim()).ok()?;
    if record.kind != "container" {
        return None;
    }
    let (action, detail) = dockwarden_core::EventAction::from_engine(&record.action)?;
    let container_id = ContainerId::new(&record.actor.id).ok()?;

    let mut attrs = record.actor.attributes;
    let name = attrs
        .remove("name")
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())?;

    let mut attributes = BTreeMap::new();
    if let Some(code) = attrs.remove("exitCode") {
        attributes.insert("exit_code".to_string(), code);
    }
    if let Some(health) = detail {
        attributes.insert("health".to_string(), health);
    }

    Some(CanonicalEvent {
        node_id: node_id.clone(),
        container_id,
        container_name: name,
        action,
        image: attrs.remove("image"),
        timestamp_nanos: record.time_nano,
        attributes,
    })
}

/// Short-lived set of recently seen event keys.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<String, Instant>,
    window: Duration,
    capacity: usize,
}

impl DedupCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            window,
            capacity,
        }
    }

    /// Record `key` and return true if it was not seen within the window.
    ///
    /// Once the cache reaches capacity it is cleared wholesale.
    pub fn insert(&mut self, key: String, now: Instant) -> bool {
        if let Some(at) = self.seen.get(&key) {
            if now.duration_since(*at) < self.window {
                return false;
            }
        }
        if self.seen.len() >= self.capacity {
            self.seen.clear();
        }
        self.seen.insert(key, now);
        true
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns true if no key is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Event feed consumer for one node.
pub struct EventIngestor {
    node_id: NodeId,
    transport: Arc<NodeTransport>,
    config: IngestConfig,
    filter: EventFilter,
    known: Arc<KnownStates>,
    raw_bus: Arc<EventBus<CanonicalEvent>>,
    monitor: Arc<StateMonitor>,
    dedup: Mutex<DedupCache>,
    starting: AtomicBool,
    active: AtomicUsize,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<StreamCancel>>,
}

impl EventIngestor {
    /// Create an ingestor; call [`EventIngestor::start`] to begin reading.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        transport: Arc<NodeTransport>,
        config: IngestConfig,
        known: Arc<KnownStates>,
        raw_bus: Arc<EventBus<CanonicalEvent>>,
        monitor: Arc<StateMonitor>,
    ) -> Self {
        let dedup = DedupCache::new(config.dedup_window(), config.dedup_capacity);
        Self {
            node_id,
            transport,
            config,
            filter: EventFilter::default(),
            known,
            raw_bus,
            monitor,
            dedup: Mutex::new(dedup),
            starting: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Start the read loop. Calls while a loop is running are ignored.
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.starting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run().await;
            this.starting.store(false, Ordering::SeqCst);
        });
        *self.task.lock() = Some(handle);
    }

    async fn run(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            match self.transport.open_stream(&self.filter).await {
                Ok(StreamOpen::AlreadyActive(_)) => {
                    debug!(node_id = %self.node_id, "Event stream already active");
                    return;
                }
                Ok(StreamOpen::Opened { events, cancel }) => {
                    *self.cancel.lock() = Some(cancel);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    info!(node_id = %self.node_id, mode = %self.transport.mode(), "Event stream started");
                    self.consume(events).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.cancel.lock().take();
                }
                Err(e) => {
                    warn!(node_id = %self.node_id, error = %e, "Failed to open event stream");
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            debug!(
                node_id = %self.node_id,
                delay_secs = self.config.restart_delay_secs,
                "Event stream ended, restarting"
            );
            tokio::time::sleep(self.config.restart_delay()).await;
        }
    }

    async fn consume(&self, mut events: ByteStream) {
        let mut lines = LineBuffer::default();
        while let Some(chunk) = events.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in lines.push(&bytes) {
                        self.ingest_line(&line);
                    }
                }
                Err(e) => {
                    warn!(node_id = %self.node_id, error = %e, "Event stream error");
                    return;
                }
            }
        }
    }

    /// Process one raw event line. Returns true if it produced a new event.
    pub fn ingest_line(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        let Some(event) = parse_event(&self.node_id, line) else {
            trace!(node_id = %self.node_id, line, "Ignored event record");
            return false;
        };
        if !self.dedup.lock().insert(event.dedup_key(), Instant::now()) {
            trace!(node_id = %self.node_id, key = %event.dedup_key(), "Duplicate event dropped");
            return false;
        }
        if let Some(state) = event.action.resulting_state() {
            self.known.set(event.container_id.clone(), state);
        }
        debug!(
            node_id = %self.node_id,
            container = %event.container_name,
            action = %event.action,
            "Container event"
        );
        self.raw_bus.publish(&event);
        self.monitor.handle_event(event);
        true
    }

    /// Number of streams currently being read.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop reading and prevent restarts.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for EventIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockwarden_core::{ContainerState, EventAction, Notification};
    use dockwarden_transport::mock::{MockEngine, MockShell};
    use dockwarden_transport::{EngineApi, RemoteShell};
    use serde_json::json;

    use crate::config::MonitorConfig;

    fn node() -> NodeId {
        NodeId::new("n1").unwrap()
    }

    fn die_line(id: &str, name: &str, nanos: i64) -> String {
        json!({
            "Type": "container",
            "Action": "die",
            "Actor": { "ID": id, "Attributes": { "name": name, "image": "nginx", "exitCode": "137" } },
            "time": nanos / 1_000_000_000,
            "timeNano": nanos
        })
        .to_string()
    }

    fn ingestor() -> (Arc<EventIngestor>, Arc<KnownStates>, Arc<Mutex<Vec<Notification>>>) {
        let engine = MockEngine::new();
        let transport = Arc::new(NodeTransport::new(
            "n1",
            Arc::new(MockShell::new()) as Arc<dyn RemoteShell>,
            Some(Arc::new(engine.clone()) as Arc<dyn EngineApi>),
            Arc::new(engine.sibling()) as Arc<dyn EngineApi>,
        ));
        let known = Arc::new(KnownStates::new());
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |n: &Notification| sink.lock().push(n.clone()));
        let monitor = Arc::new(StateMonitor::new(
            node(),
            "Node 1",
            MonitorConfig::default(),
            Arc::clone(&known),
            bus,
        ));
        let ingestor = Arc::new(EventIngestor::new(
            node(),
            transport,
            IngestConfig::default(),
            Arc::clone(&known),
            EventBus::new(),
            monitor,
        ));
        (ingestor, known, seen)
    }

    #[test]
    fn parses_container_record() {
        let event = parse_event(&node(), &die_line("abc", "/web", 1_700_000_000_000_000_001)).unwrap();
        assert_eq!(event.container_name, "web");
        assert_eq!(event.action, EventAction::Die);
        assert_eq!(event.image.as_deref(), Some("nginx"));
        assert_eq!(event.timestamp_nanos, 1_700_000_000_000_000_001);
        assert_eq!(event.attributes.get("exit_code").map(String::as_str), Some("137"));
    }

    #[test]
    fn legacy_field_names_are_not_read() {
        let line = json!({
            "Type": "container",
            "status": "start",
            "id": "abc",
            "from": "redis:7",
            "Actor": { "Attributes": { "name": "cache" } },
            "time": 1_700_000_000
        })
        .to_string();
        assert!(parse_event(&node(), &line).is_none());
    }

    #[test]
    fn missing_optional_fields_default() {
        let line = json!({
            "Type": "container",
            "Action": "start",
            "Actor": { "ID": "abc", "Attributes": { "name": "cache" } }
        })
        .to_string();
        let event = parse_event(&node(), &line).unwrap();
        assert_eq!(event.action, EventAction::Start);
        assert_eq!(event.image, None);
        assert_eq!(event.timestamp_nanos, 0);
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn health_detail_becomes_attribute() {
        let line = json!({
            "Type": "container",
            "Action": "health_status: unhealthy",
            "Actor": { "ID": "abc", "Attributes": { "name": "web" } },
            "timeNano": 5
        })
        .to_string();
        let event = parse_event(&node(), &line).unwrap();
        assert_eq!(event.action, EventAction::HealthStatus);
        assert_eq!(event.attributes.get("health").map(String::as_str), Some("unhealthy"));
    }

    #[test]
    fn rejects_filtered_records() {
        let network = json!({ "Type": "network", "Action": "connect", "Actor": { "ID": "n", "Attributes": { "name": "x" } } });
        assert!(parse_event(&node(), &network.to_string()).is_none());

        let exec = json!({ "Type": "container", "Action": "exec_start: sh", "Actor": { "ID": "a", "Attributes": { "name": "x" } } });
        assert!(parse_event(&node(), &exec.to_string()).is_none());

        let nameless = json!({ "Type": "container", "Action": "die", "Actor": { "ID": "a", "Attributes": {} } });
        assert!(parse_event(&node(), &nameless.to_string()).is_none());

        assert!(parse_event(&node(), "not json").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_and_capacity() {
        let mut cache = DedupCache::new(Duration::from_millis(100), 3);
        let t0 = Instant::now();
        assert!(cache.insert("a".into(), t0));
        assert!(!cache.insert("a".into(), t0 + Duration::from_millis(50)));
        assert!(cache.insert("a".into(), t0 + Duration::from_millis(150)));

        assert!(cache.insert("b".into(), t0));
        assert!(cache.insert("c".into(), t0));
        assert_eq!(cache.len(), 3);
        assert!(cache.insert("d".into(), t0));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_lines_are_ingested_once() {
        let (ingestor, known, seen) = ingestor();
        let line = die_line("abc", "web", 42);
        assert!(ingestor.ingest_line(&line));
        assert!(!ingestor.ingest_line(&line));
        assert!(!ingestor.ingest_line(&line));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(
            known.get(&ContainerId::new("abc").unwrap()),
            Some(ContainerState::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn health_report_keeps_known_state() {
        let (ingestor, known, _seen) = ingestor();
        let id = ContainerId::new("abc").unwrap();
        let event = |action: &str, nanos: i64| {
            json!({
                "Type": "container",
                "Action": action,
                "Actor": { "ID": "abc", "Attributes": { "name": "web" } },
                "timeNano": nanos
            })
            .to_string()
        };

        assert!(ingestor.ingest_line(&event("unpause", 1)));
        assert_eq!(known.get(&id), Some(ContainerState::Running));
        assert!(ingestor.ingest_line(&event("health_status: unhealthy", 2)));
        assert_eq!(known.get(&id), Some(ContainerState::Running));
        assert!(ingestor.ingest_line(&event("pause", 3)));
        assert_eq!(known.get(&id), Some(ContainerState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_ingestor_does_not_start() {
        let (ingestor, _, _) = ingestor();
        ingestor.stop();
        ingestor.start();
        assert!(ingestor.task.lock().is_none());
        assert_eq!(ingestor.active_streams(), 0);
    }
}
