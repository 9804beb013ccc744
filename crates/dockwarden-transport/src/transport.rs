//! Dual-mode node transport.
//!
//! [`NodeTransport`] owns one node's shell session and routes engine
//! operations through the API tunnel while it works, falling back to CLI
//! commands over the shell when it does not. The switch is invisible to
//! callers apart from the `mode` and `degraded` diagnostics.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockwarden_core::{
    ContainerDetails, ContainerId, ContainerSnapshot, ExecOutput, ImageSummary, NetworkSummary,
    VolumeSummary,
};
use futures::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::engine::EngineApi;
use crate::error::{Result, TransportError};
use crate::paths::translate_foreign_path;
use crate::shell::{check_output, shell_quote, RemoteShell};
use crate::types::{CommandOutput, EventFilter, ExecOptions, StreamCancel, StreamOpen, TransportMode};

type ActiveSlot = Arc<Mutex<Option<(u64, StreamCancel)>>>;

/// Clears the active-stream slot when the stream it guards is dropped.
struct SlotGuard {
    slot: ActiveSlot,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *slot = None;
        }
    }
}

/// The command channel to one node's container engine.
pub struct NodeTransport {
    label: String,
    shell: Arc<dyn RemoteShell>,
    api: Option<Arc<dyn EngineApi>>,
    cli: Arc<dyn EngineApi>,
    mode: RwLock<TransportMode>,
    degraded: watch::Sender<bool>,
    active_stream: ActiveSlot,
    next_stream_id: AtomicU64,
}

impl NodeTransport {
    /// Assemble a transport.
    ///
    /// With an API engine the transport starts in tunnel mode; without one
    /// it is permanently in shell-exec mode.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        shell: Arc<dyn RemoteShell>,
        api: Option<Arc<dyn EngineApi>>,
        cli: Arc<dyn EngineApi>,
    ) -> Self {
        let mode = if api.is_some() {
            TransportMode::ApiTunnel
        } else {
            TransportMode::ShellExec
        };
        let (degraded, _) = watch::channel(false);
        Self {
            label: label.into(),
            shell,
            api,
            cli,
            mode: RwLock::new(mode),
            degraded,
            active_stream: Arc::new(Mutex::new(None)),
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current transport mode.
    #[must_use]
    pub fn mode(&self) -> TransportMode {
        *self.mode.read()
    }

    /// Returns true while the API tunnel is unusable and shell-exec is in use.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Watch degradation changes.
    #[must_use]
    pub fn subscribe_degraded(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// One-shot engine check at open time.
    ///
    /// Tries the API tunnel first; if it fails the engine must answer over
    /// shell-exec, and the transport starts degraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine does not answer in either mode.
    pub async fn probe(&self) -> Result<()> {
        if let Some(api) = &self.api {
            match api.ping().await {
                Ok(()) => {
                    debug!(node = %self.label, "Engine API tunnel is up");
                    return Ok(());
                }
                Err(e) => {
                    debug!(node = %self.label, error = %e, "Engine API probe failed, checking shell-exec");
                }
            }
        }
        self.with_channel_retry(|| self.cli.ping()).await?;
        if self.api.is_some() {
            self.degrade("initial API probe failed");
        }
        Ok(())
    }

    /// Switch to shell-exec mode. No-op without an API engine or when
    /// already degraded.
    pub fn degrade(&self, reason: &str) {
        if self.api.is_none() {
            return;
        }
        *self.mode.write() = TransportMode::ShellExec;
        if !self.degraded.send_replace(true) {
            debug!(node = %self.label, reason, "Switched to shell-exec");
        }
    }

    /// Re-probe the API tunnel and leave degraded mode if it answers.
    ///
    /// Returns true if the transport is (now) in tunnel mode.
    pub async fn try_restore_api(&self) -> bool {
        let Some(api) = &self.api else {
            return false;
        };
        if !self.is_degraded() {
            return true;
        }
        match api.ping().await {
            Ok(()) => {
                *self.mode.write() = TransportMode::ApiTunnel;
                self.degraded.send_replace(false);
                debug!(node = %self.label, "Switched back to API tunnel");
                true
            }
            Err(e) => {
                debug!(node = %self.label, error = %e, "Engine API still unavailable");
                false
            }
        }
    }

    fn active_api(&self) -> Option<Arc<dyn EngineApi>> {
        match (&self.api, self.mode()) {
            (Some(api), TransportMode::ApiTunnel) => Some(Arc::clone(api)),
            _ => None,
        }
    }

    /// Run `f`; on a transient channel error reconnect the session and run
    /// it once more.
    async fn with_channel_retry<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match f().await {
            Err(e) if e.is_transient() => {
                debug!(node = %self.label, error = %e, "Transient channel error, reconnecting once");
                self.shell.reconnect().await?;
                f().await
            }
            other => other,
        }
    }

    /// Route an engine operation through the active mode.
    async fn dispatch<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn EngineApi>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(api) = self.active_api() {
            match f(api).await {
                Err(e) if e.is_api_unavailable() => {
                    self.degrade(&e.to_string());
                    debug!(node = %self.label, op, "Retrying over shell-exec");
                }
                other => return other,
            }
        }
        self.with_channel_retry(|| f(Arc::clone(&self.cli))).await
    }

    /// Run a shell command on the node.
    ///
    /// # Errors
    ///
    /// Returns an error on non-zero exit or error-like stderr unless
    /// `options.raw` is set, and on session failures.
    pub async fn execute(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput> {
        self.with_channel_retry(|| async {
            let output = self.shell.run(command, options.stdin.as_deref()).await?;
            check_output(command, output, options)
        })
        .await
    }

    /// Open the engine event feed.
    ///
    /// Only one stream runs per transport; while it is active further calls
    /// return its cancel handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be opened in either mode.
    pub async fn open_stream(&self, filter: &EventFilter) -> Result<StreamOpen> {
        let (cancel, cancelled) = StreamCancel::new();
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.active_stream.lock();
            if let Some((_, existing)) = slot.as_ref() {
                if !existing.is_cancelled() {
                    return Ok(StreamOpen::AlreadyActive(existing.clone()));
                }
            }
            *slot = Some((id, cancel.clone()));
        }
        let guard = SlotGuard {
            slot: Arc::clone(&self.active_stream),
            id,
        };

        let inner = self.dispatch("events", |engine| async move { engine.events(filter).await }).await?;
        debug!(node = %self.label, mode = %self.mode(), "Event stream opened");

        let events = stream::unfold(
            (inner, guard, cancelled),
            |(mut inner, guard, mut cancelled)| async move {
                if *cancelled.borrow_and_update() {
                    return None;
                }
                let next = tokio::select! {
                    item = inner.next() => item,
                    _ = cancelled.changed() => None,
                };
                next.map(|item| (item, (inner, guard, cancelled)))
            },
        );

        Ok(StreamOpen::Opened {
            events: Box::pin(events),
            cancel,
        })
    }

    /// Returns true if an event stream is currently open.
    #[must_use]
    pub fn has_active_stream(&self) -> bool {
        self.active_stream
            .lock()
            .as_ref()
            .is_some_and(|(_, cancel)| !cancel.is_cancelled())
    }

    async fn with_path_fallback<T, F, Fut>(&self, path: &str, f: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match f(path.to_string()).await {
            Ok(value) => Ok(value),
            Err(e) => match translate_foreign_path(path) {
                Some(translated) => {
                    debug!(node = %self.label, path, translated = %translated, "Retrying with translated path");
                    f(translated).await
                }
                None => Err(e),
            },
        }
    }

    /// Read a text file on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read under its given or
    /// translated path.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.with_path_fallback(path, |p| async move {
            self.execute(&format!("cat -- {}", shell_quote(&p)), &ExecOptions::default())
                .await
                .map(|o| o.stdout)
        })
        .await
    }

    /// Check whether a path exists on the node.
    ///
    /// # Errors
    ///
    /// Returns an error only on session failures.
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let exists = |p: String| async move {
            self.execute(&format!("test -e {}", shell_quote(&p)), &ExecOptions::raw())
                .await
                .map(|o| o.success())
        };
        if exists(path.to_string()).await? {
            return Ok(true);
        }
        match translate_foreign_path(path) {
            Some(translated) => exists(translated).await,
            None => Ok(false),
        }
    }

    /// Modification time of a file on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stat'ed.
    pub async fn stat_mtime(&self, path: &str) -> Result<DateTime<Utc>> {
        self.with_path_fallback(path, |p| async move {
            let output = self
                .execute(&format!("stat -c %Y -- {}", shell_quote(&p)), &ExecOptions::default())
                .await?;
            let secs: i64 = output
                .stdout
                .trim()
                .parse()
                .map_err(|_| TransportError::Parse(format!("bad mtime {:?}", output.stdout.trim())))?;
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| TransportError::Parse(format!("mtime out of range: {secs}")))
        })
        .await
    }

    /// List containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        self.dispatch("list_containers", |e| async move { e.list_containers(all).await })
            .await
    }

    /// List containers over shell-exec regardless of mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the shell command fails.
    pub async fn list_containers_via_shell(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        self.with_channel_retry(|| self.cli.list_containers(all)).await
    }

    /// Inspect a container.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotFound`] for unknown containers.
    pub async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        self.dispatch("inspect", |e| async move { e.inspect(container).await })
            .await
    }

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn start(&self, container: &str) -> Result<()> {
        self.dispatch("start", |e| async move { e.start(container).await })
            .await
    }

    /// Stop a container with a grace period.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn stop(&self, container: &str, grace: Duration) -> Result<()> {
        self.dispatch("stop", |e| async move { e.stop(container, grace).await })
            .await
    }

    /// Restart a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn restart(&self, container: &str, grace: Duration) -> Result<()> {
        self.dispatch("restart", |e| async move { e.restart(container, grace).await })
            .await
    }

    /// Remove a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn remove(&self, container: &str, force: bool) -> Result<()> {
        self.dispatch("remove", |e| async move { e.remove(container, force).await })
            .await
    }

    /// Rename a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.dispatch("rename", |e| async move { e.rename(container, new_name).await })
            .await
    }

    /// Create a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the create body.
    pub async fn create(&self, name: &str, body: &Value) -> Result<ContainerId> {
        self.dispatch("create", |e| async move { e.create(name, body).await })
            .await
    }

    /// Attach a container to a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn connect_network(&self, network: &str, container: &str, endpoint: &Value) -> Result<()> {
        self.dispatch("connect_network", |e| async move {
            e.connect_network(network, container, endpoint).await
        })
        .await
    }

    /// Run a command inside a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the exec cannot be started.
    pub async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        self.dispatch("exec", |e| async move { e.exec(container, cmd).await })
            .await
    }

    /// Fetch container logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    pub async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String> {
        self.dispatch("logs", |e| async move { e.logs(container, tail).await })
            .await
    }

    /// List images.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.dispatch("list_images", |e| async move { e.list_images().await })
            .await
    }

    /// List networks.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        self.dispatch("list_networks", |e| async move { e.list_networks().await })
            .await
    }

    /// List volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    pub async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        self.dispatch("list_volumes", |e| async move { e.list_volumes().await })
            .await
    }

    /// Pull an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull fails.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        self.dispatch("pull_image", |e| async move { e.pull_image(image).await })
            .await
    }

    /// Cancel the event stream and close the session.
    pub async fn close(&self) {
        if let Some((_, cancel)) = self.active_stream.lock().take() {
            cancel.cancel();
        }
        self.shell.close().await;
        *self.mode.write() = TransportMode::Unknown;
    }

    /// Resolves when the underlying session has ended.
    pub async fn session_closed(&self) {
        self.shell.closed().await;
    }
}
