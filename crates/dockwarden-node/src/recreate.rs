//! Container recreation with rollback.
//!
//! ```text
//! inspect ─► [pull] ─► stop ─► rename old ─► create ─► connect networks ─► start
//!                                  │            │             │              │
//!                                  └────────────┴──── failure ┴──────────────┘
//!                                                        │
//!                              remove new, rename old back, start old if it ran
//! ```
//!
//! The renamed original is left in place on success so the operator can
//! confirm the new container before removing it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dockwarden_core::{ContainerDetails, ContainerId};
use dockwarden_transport::{endpoint_for_create, NodeTransport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::error::Result;

/// Changes applied when recreating a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecreateOptions {
    /// Environment overrides; these win over the container's current values.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Replacement image reference.
    #[serde(default)]
    pub image: Option<String>,
    /// Pull the image before stopping the container.
    #[serde(default)]
    pub pull: bool,
    /// Stop grace period; the node default is used when unset.
    #[serde(default)]
    pub stop_timeout: Option<Duration>,
}

impl RecreateOptions {
    /// Set an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Use a different image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Pull the image first.
    #[must_use]
    pub const fn with_pull(mut self) -> Self {
        self.pull = true;
        self
    }
}

/// What happened to the original container after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// No rollback was required.
    NotNeeded,
    /// The original container was restored.
    RolledBack,
    /// Restoring the original failed; the node needs manual attention.
    Failed,
}

/// Outcome of a recreate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecreateResult {
    /// True if the new container is running.
    pub success: bool,
    /// ID of the new container, when one was started.
    pub new_container_id: Option<ContainerId>,
    /// Name the original container was renamed to, kept for confirmation.
    pub old_container_name: Option<String>,
    /// Why the recreate failed.
    pub error: Option<String>,
    /// Rollback outcome.
    pub rollback: RollbackStatus,
    /// Why the rollback failed.
    pub rollback_error: Option<String>,
}

impl RecreateResult {
    /// Returns true if the container could not be restored automatically.
    #[must_use]
    pub fn requires_manual_intervention(&self) -> bool {
        self.rollback == RollbackStatus::Failed
    }
}

/// Merge `KEY=value` entries with overrides. Existing order is kept and new
/// keys are appended.
#[must_use]
pub fn merge_env(existing: &[String], overrides: &BTreeMap<String, String>) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .iter()
        .map(|entry| {
            let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
            overrides
                .get(key)
                .map_or_else(|| entry.clone(), |value| format!("{key}={value}"))
        })
        .collect();
    for (key, value) in overrides {
        let present = existing
            .iter()
            .any(|e| e.split_once('=').map_or(e.as_str(), |(k, _)| k) == key);
        if !present {
            merged.push(format!("{key}={value}"));
        }
    }
    merged
}

/// Name the original container is moved to.
#[must_use]
pub fn backup_name(name: &str) -> String {
    format!("{name}_old_{}", Utc::now().format("%Y%m%d%H%M%S"))
}

fn network_mode(details: &ContainerDetails) -> Option<&str> {
    details
        .host_config
        .get("NetworkMode")
        .and_then(Value::as_str)
}

/// The network passed at create time; the rest are connected afterwards.
fn primary_network(details: &ContainerDetails) -> Option<&str> {
    match network_mode(details) {
        Some(mode) if details.networks.contains_key(mode) => Some(mode),
        _ => details.networks.keys().next().map(String::as_str),
    }
}

fn supports_extra_networks(details: &ContainerDetails) -> bool {
    !matches!(network_mode(details), Some(mode) if mode == "host" || mode == "none" || mode.starts_with("container:"))
}

/// Engine create body for the replacement container.
#[must_use]
pub fn create_body(details: &ContainerDetails, options: &RecreateOptions) -> Value {
    let mut config = details
        .config
        .as_object()
        .cloned()
        .unwrap_or_else(Map::new);

    // Engine-assigned hostnames are the old short ID.
    let hostname_is_id = config
        .get("Hostname")
        .and_then(Value::as_str)
        .is_some_and(|h| details.id.matches(h));
    if hostname_is_id {
        config.remove("Hostname");
    }

    let image = options.image.clone().unwrap_or_else(|| details.image.clone());
    config.insert("Image".to_string(), Value::String(image));
    config.insert(
        "Env".to_string(),
        json!(merge_env(&details.env(), &options.env)),
    );
    config.insert("HostConfig".to_string(), details.host_config.clone());

    if let Some(network) = primary_network(details) {
        let endpoint = details
            .networks
            .get(network)
            .map_or_else(|| json!({}), endpoint_for_create);
        let mut endpoints = Map::new();
        endpoints.insert(network.to_string(), endpoint);
        config.insert(
            "NetworkingConfig".to_string(),
            json!({ "EndpointsConfig": endpoints }),
        );
    }
    Value::Object(config)
}

/// Replace a container with a fresh one built from its own configuration.
///
/// # Errors
///
/// Returns an error only if the container cannot be inspected or the
/// requested pull fails. Later failures are reported in the result together
/// with the rollback outcome.
pub async fn recreate(
    transport: &NodeTransport,
    container: &str,
    options: &RecreateOptions,
    default_stop_timeout: Duration,
) -> Result<RecreateResult> {
    let details = transport.inspect(container).await?;
    let name = details.name.clone();
    let was_running = details.running;
    let old_id = details.id.to_string();

    if options.pull {
        let image = options.image.as_deref().unwrap_or(&details.image);
        info!(container = %name, image, "Pulling image");
        transport.pull_image(image).await?;
    }

    let grace = options.stop_timeout.unwrap_or(default_stop_timeout);
    if was_running {
        if let Err(e) = transport.stop(&old_id, grace).await {
            warn!(container = %name, error = %e, "Stop failed, continuing");
        }
    }

    let backup = backup_name(&name);
    if let Err(e) = transport.rename(&old_id, &backup).await {
        error!(container = %name, error = %e, "Rename failed");
        let mut result = failure(format!("rename failed: {e}"), None);
        if was_running {
            match transport.start(&old_id).await {
                Ok(()) => result.rollback = RollbackStatus::RolledBack,
                Err(e) => {
                    result.rollback = RollbackStatus::Failed;
                    result.rollback_error = Some(format!("restart original failed: {e}"));
                }
            }
        }
        return Ok(result);
    }
    info!(container = %name, backup = %backup, "Original container renamed");

    let body = create_body(&details, options);
    let new_id = match transport.create(&name, &body).await {
        Ok(id) => id,
        Err(e) => {
            error!(container = %name, error = %e, "Create failed, rolling back");
            let result = failure(format!("create failed: {e}"), Some(backup.clone()));
            return Ok(rollback(transport, result, None, &old_id, &name, was_running).await);
        }
    };

    if supports_extra_networks(&details) {
        let primary = primary_network(&details);
        for (network, endpoint) in &details.networks {
            if Some(network.as_str()) == primary {
                continue;
            }
            if let Err(e) = transport
                .connect_network(network, new_id.as_str(), &endpoint_for_create(endpoint))
                .await
            {
                error!(container = %name, network = %network, error = %e, "Network connect failed, rolling back");
                let result = failure(format!("connect network {network} failed: {e}"), Some(backup.clone()));
                return Ok(rollback(transport, result, Some(&new_id), &old_id, &name, was_running).await);
            }
        }
    }

    if let Err(e) = transport.start(new_id.as_str()).await {
        error!(container = %name, error = %e, "Start failed, rolling back");
        let result = failure(format!("start failed: {e}"), Some(backup.clone()));
        return Ok(rollback(transport, result, Some(&new_id), &old_id, &name, was_running).await);
    }

    info!(container = %name, new_id = %new_id.short(), backup = %backup, "Container recreated");
    Ok(RecreateResult {
        success: true,
        new_container_id: Some(new_id),
        old_container_name: Some(backup),
        error: None,
        rollback: RollbackStatus::NotNeeded,
        rollback_error: None,
    })
}

fn failure(error: String, backup: Option<String>) -> RecreateResult {
    RecreateResult {
        success: false,
        new_container_id: None,
        old_container_name: backup,
        error: Some(error),
        rollback: RollbackStatus::NotNeeded,
        rollback_error: None,
    }
}

async fn rollback(
    transport: &NodeTransport,
    mut result: RecreateResult,
    new_id: Option<&ContainerId>,
    old_id: &str,
    name: &str,
    was_running: bool,
) -> RecreateResult {
    let mut problems = Vec::new();

    if let Some(new_id) = new_id {
        if let Err(e) = transport.remove(new_id.as_str(), true).await {
            problems.push(format!("remove new container: {e}"));
        }
    }
    match transport.rename(old_id, name).await {
        Ok(()) => result.old_container_name = None,
        Err(e) => problems.push(format!("rename original back: {e}")),
    }
    if was_running {
        if let Err(e) = transport.start(old_id).await {
            problems.push(format!("restart original: {e}"));
        }
    }

    if problems.is_empty() {
        info!(container = name, "Rolled back to original container");
        result.rollback = RollbackStatus::RolledBack;
    } else {
        let message = problems.join("; ");
        error!(container = name, error = %message, "Rollback failed, manual intervention required");
        result.rollback = RollbackStatus::Failed;
        result.rollback_error = Some(message);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(host_config: Value, networks: &[(&str, Value)]) -> ContainerDetails {
        ContainerDetails {
            id: ContainerId::new("0123456789abcdef").unwrap(),
            name: "web".into(),
            image: "nginx:1.25".into(),
            state: dockwarden_core::ContainerState::Running,
            running: true,
            exit_code: None,
            tty: false,
            config: json!({ "Image": "nginx:1.25", "Hostname": "0123456789ab", "Env": ["A=1", "B=2"] }),
            host_config,
            networks: networks
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn env_overrides_win_and_keep_order() {
        let existing = vec!["A=1".to_string(), "B=2".to_string(), "FLAG".to_string()];
        let mut overrides = BTreeMap::new();
        overrides.insert("B".to_string(), "20".to_string());
        overrides.insert("C".to_string(), "3".to_string());
        assert_eq!(
            merge_env(&existing, &overrides),
            vec!["A=1", "B=20", "FLAG", "C=3"]
        );
    }

    #[test]
    fn backup_name_format() {
        let name = backup_name("web");
        let suffix = name.strip_prefix("web_old_").unwrap();
        assert_eq!(suffix.len(), 14);
        assert!(suffix.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn body_uses_network_mode_as_primary() {
        let d = details(
            json!({ "NetworkMode": "frontend" }),
            &[
                ("backend", json!({ "Aliases": ["b"] })),
                ("frontend", json!({ "Aliases": ["web"], "IPAddress": "172.18.0.2", "NetworkID": "x" })),
            ],
        );
        let body = create_body(&d, &RecreateOptions::default().with_image("nginx:1.27").with_env("A", "9"));

        assert_eq!(body["Image"], "nginx:1.27");
        assert_eq!(body["Env"], json!(["A=9", "B=2"]));
        assert!(body.get("Hostname").is_none());
        let endpoints = &body["NetworkingConfig"]["EndpointsConfig"];
        assert_eq!(endpoints["frontend"]["Aliases"], json!(["web"]));
        assert!(endpoints["frontend"].get("IPAddress").is_none());
        assert!(endpoints.get("backend").is_none());
    }

    #[test]
    fn body_falls_back_to_first_network() {
        let d = details(
            json!({ "NetworkMode": "default" }),
            &[("zeta", json!({})), ("alpha", json!({}))],
        );
        assert_eq!(primary_network(&d), Some("alpha"));
        assert!(supports_extra_networks(&d));
    }

    #[test]
    fn host_mode_has_no_extra_networks() {
        let d = details(json!({ "NetworkMode": "host" }), &[("host", json!({}))]);
        assert!(!supports_extra_networks(&d));
        let d = details(json!({ "NetworkMode": "container:abc" }), &[]);
        assert!(!supports_extra_networks(&d));
        assert!(create_body(&d, &RecreateOptions::default())
            .get("NetworkingConfig")
            .is_none());
    }

    #[test]
    fn manual_intervention_flag() {
        let mut result = failure("boom".into(), Some("web_old".into()));
        assert!(!result.requires_manual_intervention());
        result.rollback = RollbackStatus::Failed;
        assert!(result.requires_manual_intervention());
    }
}
