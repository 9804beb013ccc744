//! End-to-end scenarios driving nodes against the in-memory engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dockwarden_core::{ContainerState, Credential, NodeDescriptor, NodeId, Notification};
use dockwarden_node::{
    ConnectionStatus, Fleet, NodeConfig, NodeConnection, RecreateOptions, RollbackStatus,
};
use dockwarden_transport::mock::{MockConnector, MockEngine};
use dockwarden_transport::TransportMode;
use parking_lot::Mutex;
use serde_json::json;

struct Harness {
    engine: MockEngine,
    connector: Arc<MockConnector>,
    fleet: Fleet,
    node: Arc<NodeConnection>,
    seen: Arc<Mutex<Vec<Notification>>>,
}

fn harness() -> Harness {
    let engine = MockEngine::new();
    let connector = Arc::new(MockConnector::new(&engine));
    let fleet = Fleet::new(connector.clone(), NodeConfig::default());
    let node = fleet
        .register(
            NodeDescriptor::new(NodeId::new("edge-1").unwrap(), "Edge 1", "10.0.0.5", "ops"),
            Credential::password("secret"),
        )
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    fleet.on_event(move |n| sink.lock().push(n.clone()));
    Harness {
        engine,
        connector,
        fleet,
        node,
        seen,
    }
}

impl Harness {
    fn kinds(&self) -> Vec<String> {
        self.seen.lock().iter().map(|n| n.kind.as_string()).collect()
    }

    async fn wait_for_stream(&self, opened: usize) {
        while self.engine.events_opened() < opened {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

fn die_event(id: &str, name: &str, nanos: i64) -> serde_json::Value {
    json!({
        "Type": "container",
        "Action": "die",
        "Actor": { "ID": id, "Attributes": { "name": name, "image": "nginx:1.25", "exitCode": "1" } },
        "time": nanos / 1_000_000_000,
        "timeNano": nanos
    })
}

#[tokio::test(start_paused = true)]
async fn die_event_reaches_listener_once() {
    let h = harness();
    let id = h.engine.add_container("web", "nginx:1.25", ContainerState::Running);

    h.node.connect().await.unwrap();
    h.wait_for_stream(1).await;

    let event = die_event(id.as_str(), "web", 1_700_000_000_000_000_000);
    h.engine.emit_event(&event);
    h.engine.emit_event(&event);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.kinds(), vec!["node.online", "container.die"]);
    let die = h.seen.lock()[1].clone();
    assert_eq!(die.node_name, "Edge 1");
    assert_eq!(die.container_name.as_deref(), Some("web"));
    assert_eq!(die.attributes.get("exit_code").map(String::as_str), Some("1"));
    assert_eq!(die.attributes.get("image").map(String::as_str), Some("nginx:1.25"));
}

#[tokio::test(start_paused = true)]
async fn event_split_across_chunks_is_reassembled() {
    let h = harness();
    let id = h.engine.add_container("web", "nginx", ContainerState::Running);
    h.node.connect().await.unwrap();
    h.wait_for_stream(1).await;

    let line = format!("{}\n", die_event(id.as_str(), "web", 42));
    let (head, tail) = line.as_bytes().split_at(line.len() / 2);
    h.engine.emit_raw(head);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.kinds(), vec!["node.online"]);
    h.engine.emit_raw(tail);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.kinds(), vec!["node.online", "container.die"]);
}

#[tokio::test(start_paused = true)]
async fn connect_backs_off_then_resets() {
    let h = harness();
    h.connector.fail_times(3);

    let started = tokio::time::Instant::now();
    h.node.connect().await.unwrap();
    let elapsed = started.elapsed();

    // Failures wait 5s, 10s and 20s before the fourth attempt succeeds.
    assert!(elapsed >= Duration::from_secs(35), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(36), "{elapsed:?}");
    assert_eq!(h.connector.attempts(), 4);
    assert_eq!(h.node.state().reconnect_attempts, 0);
    assert_eq!(h.node.backoff_for(10), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let h = harness();
    let (a, b) = tokio::join!(h.node.connect(), h.node.connect());
    a.unwrap();
    b.unwrap();
    assert_eq!(h.connector.attempts(), 1);

    h.node.connect().await.unwrap();
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.kinds(), vec!["node.online"]);
}

#[tokio::test(start_paused = true)]
async fn api_loss_degrades_without_going_offline() {
    let h = harness();
    h.engine.add_container("web", "nginx", ContainerState::Running);
    h.node.connect().await.unwrap();
    assert_eq!(h.node.state().transport_mode, TransportMode::ApiTunnel);

    h.connector.api().set_available(false);
    let containers = h.node.list_containers(true).await.unwrap();
    assert_eq!(containers.len(), 1);

    let state = h.node.state();
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert!(state.degraded);
    assert_eq!(state.transport_mode, TransportMode::ShellExec);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.kinds(), vec!["node.online", "node.degraded"]);

    h.connector.api().set_available(true);
    tokio::time::sleep(Duration::from_secs(31)).await;
    let state = h.node.state();
    assert!(!state.degraded);
    assert_eq!(state.transport_mode, TransportMode::ApiTunnel);
    assert_eq!(h.kinds(), vec!["node.online", "node.degraded", "node.recovered"]);
}

#[tokio::test(start_paused = true)]
async fn session_loss_triggers_reconnect() {
    let h = harness();
    h.node.connect().await.unwrap();
    let shell = h.connector.last_shell().unwrap();

    shell.kill_session();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.node.status(), ConnectionStatus::Connected);
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.kinds(), vec!["node.online", "node.offline", "node.online"]);
    let offline = h.seen.lock()[1].clone();
    assert_eq!(offline.attributes.get("reason").map(String::as_str), Some("session_lost"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_session_teardown_stays_disconnected() {
    let h = harness();
    h.connector.slow_close(Duration::from_secs(1));
    h.node.connect().await.unwrap();
    let shell = h.connector.last_shell().unwrap();

    shell.kill_session();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.node.status(), ConnectionStatus::Error);

    h.node.disconnect().await;
    assert_eq!(h.node.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.node.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.kinds(), vec!["node.online", "node.offline"]);
    let offline = h.seen.lock()[1].clone();
    assert_eq!(offline.attributes.get("reason").map(String::as_str), Some("disconnect"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_everything() {
    let h = harness();
    let id = h.engine.add_container("web", "nginx", ContainerState::Running);
    h.node.connect().await.unwrap();
    h.wait_for_stream(1).await;

    h.node.disconnect().await;
    assert_eq!(h.node.status(), ConnectionStatus::Disconnected);
    assert!(h.node.transport().is_err());
    assert_eq!(h.kinds(), vec!["node.online", "node.offline"]);

    h.engine.emit_event(&die_event(id.as_str(), "web", 7));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.kinds(), vec!["node.online", "node.offline"]);
    assert_eq!(h.engine.events_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn ended_stream_is_reopened() {
    let h = harness();
    h.node.connect().await.unwrap();
    h.wait_for_stream(1).await;

    h.engine.end_events();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.engine.events_opened(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.engine.events_opened(), 2);
}

fn add_networked_web(engine: &MockEngine) {
    engine.add_container("web", "nginx:1.25", ContainerState::Running);
    engine.update("web", |c| {
        c.env = vec!["A=1".into(), "B=2".into()];
        c.host_config = json!({ "NetworkMode": "frontend", "RestartPolicy": { "Name": "always" } });
        c.networks = BTreeMap::from([
            ("backend".to_string(), json!({ "Aliases": ["web"], "NetworkID": "n2" })),
            ("frontend".to_string(), json!({ "Aliases": ["web"], "IPAddress": "172.18.0.2" })),
        ]);
    });
}

#[tokio::test(start_paused = true)]
async fn recreate_replaces_container() {
    let h = harness();
    add_networked_web(&h.engine);
    let old_id = h.engine.container("web").unwrap().id;
    h.node.connect().await.unwrap();

    let options = RecreateOptions::default()
        .with_env("A", "10")
        .with_image("nginx:1.27");
    let result = h.node.recreate("web", &options).await.unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.rollback, RollbackStatus::NotNeeded);
    let backup = result.old_container_name.clone().unwrap();
    assert!(backup.starts_with("web_old_"));

    let new = h.engine.container("web").unwrap();
    assert_ne!(new.id, old_id);
    assert_eq!(Some(&new.id), result.new_container_id.as_ref());
    assert_eq!(new.state, ContainerState::Running);
    assert_eq!(new.image, "nginx:1.27");
    assert_eq!(new.env, vec!["A=10".to_string(), "B=2".to_string()]);
    assert!(new.networks.contains_key("frontend"));
    assert!(new.networks.contains_key("backend"));
    assert!(new.networks["frontend"].get("IPAddress").is_none());

    let old = h.engine.container(&backup).unwrap();
    assert_eq!(old.id, old_id);
    assert_eq!(old.state, ContainerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn recreate_pull_failure_leaves_container_untouched() {
    let h = harness();
    add_networked_web(&h.engine);
    h.node.connect().await.unwrap();
    h.engine.fail_next("pull_image", 1);

    let options = RecreateOptions::default().with_image("nginx:9").with_pull();
    assert!(h.node.recreate("web", &options).await.is_err());

    let web = h.engine.container("web").unwrap();
    assert_eq!(web.state, ContainerState::Running);
    assert_eq!(h.engine.containers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recreate_start_failure_rolls_back() {
    let h = harness();
    add_networked_web(&h.engine);
    let old_id = h.engine.container("web").unwrap().id;
    h.node.connect().await.unwrap();
    h.engine.fail_next("start", 1);

    let result = h.node.recreate("web", &RecreateOptions::default()).await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("start failed"));
    assert_eq!(result.rollback, RollbackStatus::RolledBack);
    assert!(!result.requires_manual_intervention());

    let containers = h.engine.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "web");
    assert_eq!(containers[0].id, old_id);
    assert_eq!(containers[0].state, ContainerState::Running);
}

#[tokio::test(start_paused = true)]
async fn recreate_create_failure_rolls_back() {
    let h = harness();
    add_networked_web(&h.engine);
    h.node.connect().await.unwrap();
    h.engine.fail_next("create", 1);

    let result = h.node.recreate("web", &RecreateOptions::default()).await.unwrap();
    assert_eq!(result.rollback, RollbackStatus::RolledBack);
    assert!(result.old_container_name.is_none());
    assert_eq!(h.engine.container("web").unwrap().state, ContainerState::Running);
    assert_eq!(h.engine.containers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_requires_manual_intervention() {
    let h = harness();
    add_networked_web(&h.engine);
    h.node.connect().await.unwrap();
    h.engine.fail_next("start", 2);

    let result = h.node.recreate("web", &RecreateOptions::default()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.rollback, RollbackStatus::Failed);
    assert!(result.requires_manual_intervention());
    assert!(result
        .rollback_error
        .as_deref()
        .unwrap_or_default()
        .contains("restart original"));

    let web = h.engine.container("web").unwrap();
    assert_eq!(web.state, ContainerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn fleet_disconnect_all() {
    let h = harness();
    h.fleet
        .register(
            NodeDescriptor::new(NodeId::new("edge-2").unwrap(), "Edge 2", "10.0.0.6", "ops"),
            Credential::password("secret"),
        )
        .unwrap();
    h.fleet.connect_all();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.kinds().iter().filter(|k| *k == "node.online").count(), 2);

    h.fleet.disconnect_all().await;
    assert_eq!(h.kinds().iter().filter(|k| *k == "node.offline").count(), 2);
}
