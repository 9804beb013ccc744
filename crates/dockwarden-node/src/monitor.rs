//! State-change monitor.
//!
//! Sits between the ingestor (and the degraded-mode poller) and the
//! notification bus:
//!
//! ```text
//!  CanonicalEvent ──► flapping window ──► debounce ──► Notification
//!                         │                  │
//!                   one `flapping`     start/stop pairs
//!                   then suppress      cancel each other
//! ```
//!
//! Snapshot diffs from the fallback poll are turned into synthetic events
//! and go through the same path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dockwarden_core::{
    CanonicalEvent, ContainerId, ContainerSnapshot, ContainerState, EventAction, NodeId,
    Notification,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::config::MonitorConfig;
use crate::state::KnownStates;

struct Pending {
    action: EventAction,
    seq: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct FlapWindow {
    transitions: VecDeque<Instant>,
    flapping: bool,
    last_state: Option<ContainerState>,
}

impl FlapWindow {
    /// Record the state implied by `action`. Returns true if the container
    /// moved between running and not running.
    fn observe(&mut self, action: EventAction) -> bool {
        let Some(next) = action.resulting_state() else {
            return false;
        };
        let changed = match self.last_state {
            Some(prev) => prev.is_running() != next.is_running(),
            None => true,
        };
        self.last_state = Some(next);
        changed
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<ContainerId, Pending>,
    windows: HashMap<ContainerId, FlapWindow>,
    next_seq: u64,
    stopped: bool,
}

impl Inner {
    fn cancel_pending(&mut self, id: &ContainerId) -> Option<EventAction> {
        self.pending.remove(id).map(|p| {
            p.timer.abort();
            p.action
        })
    }
}

/// Per-node debounce, flapping detection and snapshot diffing.
pub struct StateMonitor {
    node_id: NodeId,
    node_name: String,
    config: MonitorConfig,
    known: Arc<KnownStates>,
    bus: Arc<EventBus<Notification>>,
    inner: Arc<Mutex<Inner>>,
}

impl StateMonitor {
    /// Create a monitor publishing to `bus`.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        node_name: impl Into<String>,
        config: MonitorConfig,
        known: Arc<KnownStates>,
        bus: Arc<EventBus<Notification>>,
    ) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            config,
            known,
            bus,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Process one canonical event.
    pub fn handle_event(&self, event: CanonicalEvent) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        let id = event.container_id.clone();

        if event.action.is_transition() {
            let now = Instant::now();
            let window_len = self.config.flapping_window();
            let window = inner.windows.entry(id.clone()).or_default();
            while window
                .transitions
                .front()
                .is_some_and(|t| now.duration_since(*t) > window_len)
            {
                window.transitions.pop_front();
            }
            if window.transitions.is_empty() && window.flapping {
                info!(node_id = %self.node_id, container = %event.container_name, "Container stopped flapping");
                window.flapping = false;
            }
            let changed = window.observe(event.action);
            if changed {
                window.transitions.push_back(now);
            }
            let count = window.transitions.len();

            if window.flapping {
                inner.cancel_pending(&id);
                debug!(node_id = %self.node_id, container = %event.container_name, action = %event.action, "Suppressed event from flapping container");
                return;
            }
            if changed && count > self.config.flapping_threshold {
                window.flapping = true;
                inner.cancel_pending(&id);
                drop(inner);
                info!(node_id = %self.node_id, container = %event.container_name, transitions = count, "Container is flapping");
                self.emit_flapping(&event, count);
                return;
            }
        }

        if event.action.is_debounced() {
            if let Some(pending) = inner.pending.get(&id) {
                if Some(pending.action) == event.action.opposite() {
                    let cancelled = inner.cancel_pending(&id);
                    debug!(
                        node_id = %self.node_id,
                        container = %event.container_name,
                        first = ?cancelled,
                        second = %event.action,
                        "Opposing actions within debounce window, both suppressed"
                    );
                    return;
                }
            }
            inner.cancel_pending(&id);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let action = event.action;
            let timer = self.spawn_timer(id.clone(), seq, event);
            inner.pending.insert(id, Pending { action, seq, timer });
            return;
        }

        drop(inner);
        self.bus.publish(&Notification::from_event(&event, &self.node_name));
    }

    fn spawn_timer(&self, id: ContainerId, seq: u64, event: CanonicalEvent) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let bus = Arc::clone(&self.bus);
        let node_name = self.node_name.clone();
        let delay = self.config.debounce();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let due = {
                let mut inner = inner.lock();
                let current = inner.pending.get(&id).is_some_and(|p| p.seq == seq);
                if current {
                    inner.pending.remove(&id);
                }
                current && !inner.stopped
            };
            if due {
                bus.publish(&Notification::from_event(&event, node_name));
            }
        })
    }

    fn emit_flapping(&self, event: &CanonicalEvent, count: usize) {
        let mut flapping = event.clone();
        flapping.action = EventAction::Flapping;
        flapping.attributes.insert("transitions".to_string(), count.to_string());
        flapping.attributes.insert(
            "window_secs".to_string(),
            self.config.flapping_window_secs.to_string(),
        );
        flapping.attributes.insert("last_action".to_string(), event.action.to_string());
        self.bus.publish(&Notification::from_event(&flapping, &self.node_name));
    }

    /// Diff a full container listing against the last known states.
    ///
    /// A container seen for the first time only records a baseline. A
    /// changed state becomes a synthetic event. Containers missing from the
    /// listing are forgotten.
    pub fn handle_snapshot(&self, snapshot: &[ContainerSnapshot]) {
        let present: Vec<ContainerId> = snapshot.iter().map(|c| c.id.clone()).collect();
        self.known.retain_only(&present);

        for container in snapshot {
            let Some(previous) = self.known.set(container.id.clone(), container.state) else {
                continue;
            };
            if previous == container.state {
                continue;
            }
            let action = EventAction::from_transition(previous, container.state);
            debug!(
                node_id = %self.node_id,
                container = container.name(),
                from = %previous,
                to = %container.state,
                "State change detected by poll"
            );
            let mut attributes = BTreeMap::new();
            attributes.insert("source".to_string(), "poll".to_string());
            self.handle_event(CanonicalEvent {
                node_id: self.node_id.clone(),
                container_id: container.id.clone(),
                container_name: container.name().to_string(),
                action,
                image: Some(container.image.clone()),
                timestamp_nanos: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                attributes,
            });
        }
    }

    /// Number of events currently held back by debounce.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns true while the container is considered flapping.
    #[must_use]
    pub fn is_flapping(&self, id: &ContainerId) -> bool {
        self.inner.lock().windows.get(id).is_some_and(|w| w.flapping)
    }

    /// Cancel all pending timers and ignore further input.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        for (_, pending) in inner.pending.drain() {
            pending.timer.abort();
        }
    }
}

impl Drop for StateMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockwarden_core::{ContainerState, NotificationKind};
    use std::time::Duration;

    fn setup(config: MonitorConfig) -> (StateMonitor, Arc<Mutex<Vec<Notification>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        // Held for the lifetime of the bus; dropping a Subscription keeps it registered.
        let _sub = bus.subscribe(move |n: &Notification| sink.lock().push(n.clone()));
        let monitor = StateMonitor::new(
            NodeId::new("n1").unwrap(),
            "Node 1",
            config,
            Arc::new(KnownStates::new()),
            bus,
        );
        (monitor, seen)
    }

    fn event(action: EventAction) -> CanonicalEvent {
        CanonicalEvent {
            node_id: NodeId::new("n1").unwrap(),
            container_id: ContainerId::new("c1").unwrap(),
            container_name: "web".into(),
            action,
            image: None,
            timestamp_nanos: 1,
            attributes: BTreeMap::new(),
        }
    }

    fn snapshot(state: ContainerState) -> ContainerSnapshot {
        ContainerSnapshot {
            id: ContainerId::new("c1").unwrap(),
            names: vec!["web".into()],
            image: "nginx".into(),
            state,
            status: String::new(),
        }
    }

    fn kinds(seen: &Arc<Mutex<Vec<Notification>>>) -> Vec<String> {
        seen.lock().iter().map(|n| n.kind.as_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn non_debounced_actions_emit_immediately() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_event(event(EventAction::Die));
        assert_eq!(kinds(&seen), vec!["container.die"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_emits_after_debounce() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_event(event(EventAction::Start));
        assert!(seen.lock().is_empty());
        assert_eq!(monitor.pending(), 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(kinds(&seen), vec!["container.start"]);
        assert_eq!(monitor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn opposing_pair_is_fully_suppressed() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_event(event(EventAction::Stop));
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.handle_event(event(EventAction::Start));
        assert_eq!(monitor.pending(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_action_restarts_debounce() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_event(event(EventAction::Start));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        monitor.handle_event(event(EventAction::Start));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(seen.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(kinds(&seen), vec!["container.start"]);
    }

    fn bounce(i: usize) -> CanonicalEvent {
        event(if i % 2 == 0 { EventAction::Die } else { EventAction::Restart })
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_emits_once_then_suppresses() {
        let (monitor, seen) = setup(MonitorConfig::default());
        for i in 0..5 {
            monitor.handle_event(bounce(i));
        }
        assert_eq!(seen.lock().len(), 5);

        monitor.handle_event(bounce(5));
        assert!(monitor.is_flapping(&ContainerId::new("c1").unwrap()));
        for i in 6..16 {
            monitor.handle_event(bounce(i));
        }

        let kinds = kinds(&seen);
        assert_eq!(kinds.len(), 6);
        assert_eq!(kinds[5], "container.flapping");
        let flapping = seen.lock()[5].clone();
        assert_eq!(flapping.kind, NotificationKind::Container(EventAction::Flapping));
        assert_eq!(flapping.attributes.get("transitions").map(String::as_str), Some("6"));
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_clears_after_quiet_window() {
        let (monitor, seen) = setup(MonitorConfig::default());
        for i in 0..6 {
            monitor.handle_event(bounce(i));
        }
        assert!(monitor.is_flapping(&ContainerId::new("c1").unwrap()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        monitor.handle_event(event(EventAction::Die));
        assert!(!monitor.is_flapping(&ContainerId::new("c1").unwrap()));
        assert_eq!(seen.lock().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_events_without_state_change_do_not_flap() {
        let (monitor, seen) = setup(MonitorConfig::default());
        for _ in 0..10 {
            monitor.handle_event(event(EventAction::Die));
        }
        assert_eq!(seen.lock().len(), 10);
        assert!(!monitor.is_flapping(&ContainerId::new("c1").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn two_manual_restarts_are_not_flapping() {
        let (monitor, seen) = setup(MonitorConfig::default());
        let restart = [
            EventAction::Die,
            EventAction::Stop,
            EventAction::Start,
            EventAction::Restart,
        ];
        for action in restart {
            monitor.handle_event(event(action));
        }
        tokio::time::sleep(Duration::from_secs(20)).await;
        for action in restart {
            monitor.handle_event(event(action));
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!monitor.is_flapping(&ContainerId::new("c1").unwrap()));
        let kinds = kinds(&seen);
        assert!(!kinds.contains(&"container.flapping".to_string()));
        assert_eq!(
            kinds,
            vec!["container.die", "container.restart", "container.die", "container.restart"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_do_not_count_as_transitions() {
        let (monitor, seen) = setup(MonitorConfig::default());
        for _ in 0..10 {
            monitor.handle_event(event(EventAction::HealthStatus));
        }
        assert_eq!(seen.lock().len(), 10);
        assert!(!monitor.is_flapping(&ContainerId::new("c1").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_first_sighting_is_baseline() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_snapshot(&[snapshot(ContainerState::Running)]);
        monitor.handle_snapshot(&[snapshot(ContainerState::Running)]);
        assert!(seen.lock().is_empty());
        assert_eq!(monitor.pending(), 0);

        monitor.handle_snapshot(&[snapshot(ContainerState::Stopped)]);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind.as_string(), "container.stop");
        assert_eq!(seen[0].attributes.get("source").map(String::as_str), Some("poll"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timers() {
        let (monitor, seen) = setup(MonitorConfig::default());
        monitor.handle_event(event(EventAction::Start));
        monitor.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.handle_event(event(EventAction::Die));
        assert!(seen.lock().is_empty());
    }
}
