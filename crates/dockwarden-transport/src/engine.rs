//! Container engine operations.
//!
//! [`EngineApi`] is implemented twice: by the HTTP API tunnel and by the
//! engine CLI over the remote shell. Both normalize into the read models of
//! `dockwarden-core`.

use std::time::Duration;

use async_trait::async_trait;
use dockwarden_core::{
    ContainerDetails, ContainerId, ContainerSnapshot, ContainerState, ExecOutput, ImageSummary,
    NetworkSummary, VolumeSummary,
};
use serde_json::Value;

use crate::error::{Result, TransportError};
use crate::types::{ByteStream, EventFilter};

/// Operations on a node's container engine.
///
/// Container arguments accept either an ID or a name.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Check that the engine answers.
    async fn ping(&self) -> Result<()>;

    /// List containers; stopped ones are included when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>>;

    /// Inspect one container.
    async fn inspect(&self, container: &str) -> Result<ContainerDetails>;

    /// Start a container.
    async fn start(&self, container: &str) -> Result<()>;

    /// Stop a container, waiting up to `grace` before the engine kills it.
    async fn stop(&self, container: &str, grace: Duration) -> Result<()>;

    /// Restart a container.
    async fn restart(&self, container: &str, grace: Duration) -> Result<()>;

    /// Remove a container.
    async fn remove(&self, container: &str, force: bool) -> Result<()>;

    /// Rename a container.
    async fn rename(&self, container: &str, new_name: &str) -> Result<()>;

    /// Create a container from an engine create body and return its ID.
    async fn create(&self, name: &str, body: &Value) -> Result<ContainerId>;

    /// Attach a container to a network with the given endpoint settings.
    async fn connect_network(&self, network: &str, container: &str, endpoint: &Value) -> Result<()>;

    /// Run a command inside a container and capture its output.
    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Fetch container logs, optionally limited to the last `tail` lines.
    async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String>;

    /// List local images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// List networks.
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>>;

    /// List volumes.
    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>>;

    /// Pull an image reference.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Open the engine event feed as a stream of JSON-lines chunks.
    async fn events(&self, filter: &EventFilter) -> Result<ByteStream>;
}

/// Split `repo[:tag]` into its parts; registry ports are not tags.
#[must_use]
pub fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rfind(':') {
        Some(i) if !image[i + 1..].contains('/') => (&image[..i], Some(&image[i + 1..])),
        _ => (image, None),
    }
}

/// Render a byte count the way the engine CLI does (`12.3MB`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0}{}", UNITS[unit])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

pub(crate) fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

pub(crate) fn container_id(raw: &str) -> Result<ContainerId> {
    ContainerId::new(raw).map_err(|e| TransportError::Parse(format!("container id {raw:?}: {e}")))
}

/// Derive a state from a CLI status line when the engine omits `State`.
pub(crate) fn state_from_status(status: &str) -> ContainerState {
    if status.starts_with("Up") {
        if status.contains("(Paused)") {
            ContainerState::Paused
        } else {
            ContainerState::Running
        }
    } else if status.starts_with("Restarting") {
        ContainerState::Restarting
    } else if status.starts_with("Created") {
        ContainerState::Created
    } else {
        ContainerState::Stopped
    }
}

/// Endpoint settings that the engine assigns at runtime and rejects on create.
const RUNTIME_ENDPOINT_FIELDS: &[&str] = &[
    "NetworkID",
    "EndpointID",
    "Gateway",
    "IPAddress",
    "IPPrefixLen",
    "IPv6Gateway",
    "GlobalIPv6Address",
    "GlobalIPv6PrefixLen",
    "MacAddress",
    "DNSNames",
];

/// Strip runtime-assigned fields from an inspected endpoint.
#[must_use]
pub fn endpoint_for_create(endpoint: &Value) -> Value {
    let mut cleaned = endpoint.clone();
    if let Some(map) = cleaned.as_object_mut() {
        for field in RUNTIME_ENDPOINT_FIELDS {
            map.remove(*field);
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_refs() {
        assert_eq!(split_image_ref("nginx"), ("nginx", None));
        assert_eq!(split_image_ref("nginx:1.25"), ("nginx", Some("1.25")));
        assert_eq!(
            split_image_ref("registry:5000/team/app:v2"),
            ("registry:5000/team/app", Some("v2"))
        );
        assert_eq!(split_image_ref("registry:5000/team/app"), ("registry:5000/team/app", None));
        assert_eq!(split_image_ref("app@sha256:abc"), ("app@sha256:abc", None));
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(187_000_000), "187.0MB");
        assert_eq!(format_size(-1), "0B");
    }

    #[test]
    fn status_states() {
        assert_eq!(state_from_status("Up 3 hours"), ContainerState::Running);
        assert_eq!(state_from_status("Up 3 hours (Paused)"), ContainerState::Paused);
        assert_eq!(state_from_status("Exited (0) 2 days ago"), ContainerState::Stopped);
        assert_eq!(state_from_status("Created"), ContainerState::Created);
        assert_eq!(state_from_status("Restarting (1) 5 seconds ago"), ContainerState::Restarting);
    }

    #[test]
    fn endpoint_cleanup() {
        let ep = json!({ "Aliases": ["web"], "NetworkID": "n", "IPAddress": "172.18.0.2", "IPAMConfig": null });
        let cleaned = endpoint_for_create(&ep);
        assert_eq!(cleaned, json!({ "Aliases": ["web"], "IPAMConfig": null }));
    }
}
