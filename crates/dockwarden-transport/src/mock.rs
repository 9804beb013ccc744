//! In-memory engine, shell and connector for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockwarden_core::{
    ContainerDetails, ContainerId, ContainerSnapshot, ContainerState, Credential, ExecOutput,
    ImageSummary, NetworkSummary, NodeDescriptor, VolumeSummary,
};
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::connector::Connector;
use crate::engine::EngineApi;
use crate::error::{Result, TransportError};
use crate::shell::RemoteShell;
use crate::transport::NodeTransport;
use crate::types::{ByteStream, CommandOutput, DuplexIo, EventFilter};

/// A container held by [`MockEngine`].
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// Container ID.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Current state.
    pub state: ContainerState,
    /// Environment entries.
    pub env: Vec<String>,
    /// Raw host config.
    pub host_config: Value,
    /// Network name to endpoint settings.
    pub networks: BTreeMap<String, Value>,
    /// Body the container was created with, if created through the API.
    pub create_body: Option<Value>,
}

#[derive(Default)]
struct MockState {
    containers: Mutex<Vec<MockContainer>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, String>>,
    events: Mutex<Option<mpsc::UnboundedSender<Result<Vec<u8>>>>>,
    events_opened: AtomicUsize,
    next_id: AtomicU64,
}

/// An in-memory container engine.
///
/// Clones share everything. [`MockEngine::sibling`] shares the container
/// table but has its own availability flag, so one instance can stand in
/// for the API tunnel and another for shell-exec.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
    available: Arc<AtomicBool>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create an empty, available engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// An engine view over the same containers with its own availability.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make every operation fail with `ApiUnavailable` (or stop doing so).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add a container and return its ID.
    pub fn add_container(&self, name: &str, image: &str, state: ContainerState) -> ContainerId {
        let id = self.new_id();
        self.state.containers.lock().push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            state,
            env: Vec::new(),
            host_config: json!({}),
            networks: BTreeMap::new(),
            create_body: None,
        });
        id
    }

    /// Modify a container in place.
    pub fn update(&self, name: &str, f: impl FnOnce(&mut MockContainer)) {
        if let Some(c) = self.state.containers.lock().iter_mut().find(|c| c.name == name) {
            f(c);
        }
    }

    /// Set a container's state.
    pub fn set_state(&self, name: &str, state: ContainerState) {
        self.update(name, |c| c.state = state);
    }

    /// Look up a container by name.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state
            .containers
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// All containers.
    #[must_use]
    pub fn containers(&self) -> Vec<MockContainer> {
        self.state.containers.lock().clone()
    }

    /// Fail the next `times` calls of `op` with an engine error.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.state.failures.lock().insert(op.to_string(), times);
    }

    /// Recorded calls as `op target`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    /// Set the log output of a container.
    pub fn set_logs(&self, name: &str, logs: &str) {
        self.state.logs.lock().insert(name.to_string(), logs.to_string());
    }

    /// Push one JSON event record to the open event stream.
    pub fn emit_event(&self, event: &Value) {
        let mut line = event.to_string().into_bytes();
        line.push(b'\n');
        self.emit_raw(&line);
    }

    /// Push raw bytes to the open event stream.
    pub fn emit_raw(&self, bytes: &[u8]) {
        if let Some(tx) = self.state.events.lock().as_ref() {
            let _ = tx.unbounded_send(Ok(bytes.to_vec()));
        }
    }

    /// End the open event stream.
    pub fn end_events(&self) {
        self.state.events.lock().take();
    }

    /// Number of times the event stream was opened.
    #[must_use]
    pub fn events_opened(&self) -> usize {
        self.state.events_opened.load(Ordering::SeqCst)
    }

    fn new_id(&self) -> ContainerId {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        ContainerId::new(format!("{n:064x}")).unwrap_or_else(|_| unreachable!("hex ids are valid"))
    }

    fn check(&self, op: &str, target: &str) -> Result<()> {
        self.state.calls.lock().push(format!("{op} {target}").trim_end().to_string());
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::ApiUnavailable("mock engine unavailable".into()));
        }
        let mut failures = self.state.failures.lock();
        if let Some(remaining) = failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Engine {
                    status: 500,
                    message: format!("injected {op} failure"),
                });
            }
        }
        Ok(())
    }

    fn with_container<T>(&self, key: &str, f: impl FnOnce(&mut MockContainer) -> Result<T>) -> Result<T> {
        let mut containers = self.state.containers.lock();
        let container = containers
            .iter_mut()
            .find(|c| c.name == key || c.id.matches(key))
            .ok_or_else(|| TransportError::NotFound(format!("No such container: {key}")))?;
        f(container)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.state.containers.lock().iter().any(|c| c.name == name)
    }

    fn conflict(name: &str) -> TransportError {
        TransportError::Engine {
            status: 409,
            message: format!("Conflict. The container name \"/{name}\" is already in use"),
        }
    }
}

fn inspect_doc(c: &MockContainer) -> Value {
    json!({
        "Id": c.id.as_str(),
        "Name": format!("/{}", c.name),
        "State": {
            "Status": c.state.as_str(),
            "Running": c.state.is_running(),
            "ExitCode": 0,
        },
        "Config": { "Image": c.image, "Env": c.env, "Tty": false },
        "HostConfig": c.host_config,
        "NetworkSettings": { "Networks": c.networks },
    })
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn ping(&self) -> Result<()> {
        self.check("ping", "")
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        self.check("list_containers", "")?;
        Ok(self
            .state
            .containers
            .lock()
            .iter()
            .filter(|c| all || c.state.is_running())
            .map(|c| ContainerSnapshot {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.image.clone(),
                state: c.state,
                status: c.state.as_str().to_string(),
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        self.check("inspect", container)?;
        let doc = self.with_container(container, |c| Ok(inspect_doc(c)))?;
        ContainerDetails::from_inspect(&doc).ok_or_else(|| TransportError::Parse("mock inspect".into()))
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.check("start", container)?;
        self.with_container(container, |c| {
            c.state = ContainerState::Running;
            Ok(())
        })
    }

    async fn stop(&self, container: &str, _grace: Duration) -> Result<()> {
        self.check("stop", container)?;
        self.with_container(container, |c| {
            c.state = ContainerState::Stopped;
            Ok(())
        })
    }

    async fn restart(&self, container: &str, _grace: Duration) -> Result<()> {
        self.check("restart", container)?;
        self.with_container(container, |c| {
            c.state = ContainerState::Running;
            Ok(())
        })
    }

    async fn remove(&self, container: &str, force: bool) -> Result<()> {
        self.check("remove", container)?;
        let mut containers = self.state.containers.lock();
        let index = containers
            .iter()
            .position(|c| c.name == container || c.id.matches(container))
            .ok_or_else(|| TransportError::NotFound(format!("No such container: {container}")))?;
        if containers[index].state.is_running() && !force {
            return Err(TransportError::Engine {
                status: 409,
                message: "You cannot remove a running container".into(),
            });
        }
        containers.remove(index);
        Ok(())
    }

    async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.check("rename", &format!("{container} {new_name}"))?;
        if self.name_taken(new_name) {
            return Err(Self::conflict(new_name));
        }
        self.with_container(container, |c| {
            c.name = new_name.to_string();
            Ok(())
        })
    }

    async fn create(&self, name: &str, body: &Value) -> Result<ContainerId> {
        self.check("create", name)?;
        if self.name_taken(name) {
            return Err(Self::conflict(name));
        }
        let id = self.new_id();
        let env = body
            .get("Env")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let networks = body
            .pointer("/NetworkingConfig/EndpointsConfig")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        self.state.containers.lock().push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: body.get("Image").and_then(Value::as_str).unwrap_or_default().to_string(),
            state: ContainerState::Created,
            env,
            host_config: body.get("HostConfig").cloned().unwrap_or_else(|| json!({})),
            networks,
            create_body: Some(body.clone()),
        });
        Ok(id)
    }

    async fn connect_network(&self, network: &str, container: &str, endpoint: &Value) -> Result<()> {
        self.check("connect_network", &format!("{network} {container}"))?;
        self.with_container(container, |c| {
            c.networks.insert(network.to_string(), endpoint.clone());
            Ok(())
        })
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        self.check("exec", container)?;
        self.with_container(container, |_| Ok(()))?;
        Ok(ExecOutput {
            stdout: format!("{}\n", cmd.join(" ")),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String> {
        self.check("logs", container)?;
        let name = self.with_container(container, |c| Ok(c.name.clone()))?;
        let logs = self.state.logs.lock().get(&name).cloned().unwrap_or_default();
        Ok(match tail {
            Some(n) => {
                let lines: Vec<&str> = logs.lines().collect();
                let start = lines.len().saturating_sub(n);
                lines[start..].iter().map(|l| format!("{l}\n")).collect()
            }
            None => logs,
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.check("list_images", "")?;
        let images: BTreeSet<String> = self.state.containers.lock().iter().map(|c| c.image.clone()).collect();
        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: format!("sha256:{image}"),
                tags: vec![image],
                size: "0B".into(),
                created: String::new(),
            })
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        self.check("list_networks", "")?;
        let names: BTreeSet<String> = self
            .state
            .containers
            .lock()
            .iter()
            .flat_map(|c| c.networks.keys().cloned())
            .collect();
        Ok(names
            .into_iter()
            .map(|name| NetworkSummary {
                id: name.clone(),
                name,
                driver: "bridge".into(),
                scope: "local".into(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        self.check("list_volumes", "")?;
        Ok(Vec::new())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check("pull_image", image)
    }

    async fn events(&self, _filter: &EventFilter) -> Result<ByteStream> {
        self.check("events", "")?;
        let (tx, rx) = mpsc::unbounded();
        *self.state.events.lock() = Some(tx);
        self.state.events_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(rx))
    }
}

/// A scripted remote shell.
///
/// Responses are matched by substring in registration order; unmatched
/// commands exit 127.
pub struct MockShell {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    commands: Mutex<Vec<String>>,
    last_stdin: Mutex<Option<Vec<u8>>>,
    channel_failures: AtomicU32,
    reconnects: AtomicU32,
    close_delay: Mutex<Duration>,
    alive: watch::Sender<bool>,
}

impl Default for MockShell {
    fn default() -> Self {
        Self::new()
    }
}

impl MockShell {
    /// Create a live shell with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            responses: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            last_stdin: Mutex::new(None),
            channel_failures: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            close_delay: Mutex::new(Duration::ZERO),
            alive,
        }
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.responses.lock().push((pattern.to_string(), output));
    }

    /// Fail the next `times` commands with a channel error.
    pub fn fail_channel(&self, times: u32) {
        self.channel_failures.store(times, Ordering::SeqCst);
    }

    /// Make `close` take `delay` before the session ends.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    /// End the session as if keep-alives had failed.
    pub fn kill_session(&self) {
        self.alive.send_replace(false);
    }

    /// Commands run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Stdin of the most recent command that had one.
    #[must_use]
    pub fn last_stdin(&self) -> Option<Vec<u8>> {
        self.last_stdin.lock().clone()
    }

    /// Number of reconnects requested.
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Returns true while the session is open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    fn label(&self) -> &str {
        "mock"
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        self.commands.lock().push(command.to_string());
        if let Some(input) = stdin {
            *self.last_stdin.lock() = Some(input.to_vec());
        }
        if self
            .channel_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Channel("mock channel open failed".into()));
        }
        let output = self
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());
        Ok(output.unwrap_or_else(|| CommandOutput::failed(127, format!("mock: no response for {command}"))))
    }

    async fn stream(&self, command: &str) -> Result<ByteStream> {
        Err(TransportError::Unsupported(format!("mock stream: {command}")))
    }

    async fn open_channel(&self, command: &str) -> Result<Box<dyn DuplexIo>> {
        Err(TransportError::Unsupported(format!("mock channel: {command}")))
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.alive.send_replace(true);
        Ok(())
    }

    async fn close(&self) {
        let delay = *self.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.alive.send_replace(false);
    }

    async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

/// A connector that builds transports over [`MockEngine`] and [`MockShell`].
pub struct MockConnector {
    api: MockEngine,
    cli: MockEngine,
    failures: AtomicU32,
    attempts: AtomicU32,
    close_delay: Mutex<Duration>,
    shells: Mutex<Vec<Arc<MockShell>>>,
}

impl MockConnector {
    /// Create a connector whose API and shell-exec engines share `engine`'s
    /// containers.
    #[must_use]
    pub fn new(engine: &MockEngine) -> Self {
        Self {
            api: engine.clone(),
            cli: engine.sibling(),
            failures: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            close_delay: Mutex::new(Duration::ZERO),
            shells: Mutex::new(Vec::new()),
        }
    }

    /// Refuse the next `times` connection attempts.
    pub fn fail_times(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }

    /// Shells opened from now on take `delay` to close.
    pub fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    /// Total connection attempts.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The engine standing in for the API tunnel.
    #[must_use]
    pub const fn api(&self) -> &MockEngine {
        &self.api
    }

    /// The engine standing in for shell-exec.
    #[must_use]
    pub const fn cli(&self) -> &MockEngine {
        &self.cli
    }

    /// The shell of the most recent successful connection.
    #[must_use]
    pub fn last_shell(&self) -> Option<Arc<MockShell>> {
        self.shells.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, node: &NodeDescriptor, _credential: &Credential) -> Result<Arc<NodeTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect("mock connection refused".into()));
        }

        let shell = Arc::new(MockShell::new());
        shell.set_close_delay(*self.close_delay.lock());
        let transport = Arc::new(NodeTransport::new(
            node.id.to_string(),
            Arc::clone(&shell) as Arc<dyn RemoteShell>,
            Some(Arc::new(self.api.clone()) as Arc<dyn EngineApi>),
            Arc::new(self.cli.clone()) as Arc<dyn EngineApi>,
        ));
        transport.probe().await?;
        self.shells.lock().push(shell);
        Ok(transport)
    }
}
