//! Container read models.
//!
//! Both transport modes normalize engine output into these types, so the
//! rest of the system never sees engine-specific field names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ContainerId;

/// Engine-reported state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// The container's main process is running.
    Running,
    /// The container exited, died, or is being removed.
    #[default]
    Stopped,
    /// The container is paused.
    Paused,
    /// The engine is restarting the container.
    Restarting,
    /// The container was created but never started.
    Created,
}

impl ContainerState {
    /// Parse an engine state string.
    ///
    /// `exited`, `dead`, `removing` and unknown values map to `Stopped`.
    #[must_use]
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "created" => Self::Created,
            _ => Self::Stopped,
        }
    }

    /// Lower-case name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Created => "created",
        }
    }

    /// Returns true if the container is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as seen in a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Container ID.
    pub id: ContainerId,
    /// Container names without the leading `/`.
    pub names: Vec<String>,
    /// Image reference the container was created from.
    pub image: String,
    /// Engine-reported state.
    pub state: ContainerState,
    /// Human-readable status (e.g. "Up 3 hours").
    pub status: String,
}

impl ContainerSnapshot {
    /// Primary name of the container, falling back to the short ID.
    #[must_use]
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map_or_else(|| self.id.short(), String::as_str)
    }
}

/// Inspect result for a single container.
///
/// The raw configuration blocks are kept as JSON so that they can be fed back
/// to the engine unchanged when recreating the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    /// Full container ID.
    pub id: ContainerId,
    /// Container name without the leading `/`.
    pub name: String,
    /// Image reference from the container config.
    pub image: String,
    /// Normalized state.
    pub state: ContainerState,
    /// Whether the container is currently running.
    pub running: bool,
    /// Exit code of the last run, if known.
    pub exit_code: Option<i64>,
    /// Whether the container was created with a TTY.
    pub tty: bool,
    /// Raw `Config` block.
    pub config: Value,
    /// Raw `HostConfig` block.
    pub host_config: Value,
    /// Network name to raw endpoint settings.
    pub networks: BTreeMap<String, Value>,
}

impl ContainerDetails {
    /// Build details from a raw engine inspect document.
    ///
    /// Returns `None` if the document lacks an ID.
    #[must_use]
    pub fn from_inspect(doc: &Value) -> Option<Self> {
        let id = ContainerId::new(doc.get("Id")?.as_str()?).ok()?;
        let name = doc
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let config = doc.get("Config").cloned().unwrap_or(Value::Null);
        let host_config = doc.get("HostConfig").cloned().unwrap_or(Value::Null);
        let image = config
            .get("Image")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tty = config.get("Tty").and_then(Value::as_bool).unwrap_or(false);
        let state_doc = doc.get("State");
        let state = state_doc
            .and_then(|s| s.get("Status"))
            .and_then(Value::as_str)
            .map_or(ContainerState::Stopped, ContainerState::from_engine);
        let running = state_doc
            .and_then(|s| s.get("Running"))
            .and_then(Value::as_bool)
            .unwrap_or(state.is_running());
        let exit_code = state_doc
            .and_then(|s| s.get("ExitCode"))
            .and_then(Value::as_i64);
        let networks = doc
            .get("NetworkSettings")
            .and_then(|n| n.get("Networks"))
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Some(Self {
            id,
            name,
            image,
            state,
            running,
            exit_code,
            tty,
            config,
            host_config,
            networks,
        })
    }

    /// Environment entries (`KEY=value`) from the container config.
    #[must_use]
    pub fn env(&self) -> Vec<String> {
        self.config
            .get("Env")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, if the engine reported one.
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An image in the engine's local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    /// Image ID.
    pub id: String,
    /// `repository:tag` references.
    pub tags: Vec<String>,
    /// Human-readable size.
    pub size: String,
    /// Creation time as reported by the engine.
    pub created: String,
}

/// A network known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    /// Network ID.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Network driver.
    pub driver: String,
    /// Network scope (`local`, `swarm`, ...).
    pub scope: String,
}

/// A volume known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    /// Volume name.
    pub name: String,
    /// Volume driver.
    pub driver: String,
    /// Mount point on the host.
    pub mountpoint: String,
}
