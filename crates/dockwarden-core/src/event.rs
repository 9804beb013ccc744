//! Container lifecycle events and outbound notifications.
//!
//! Raw engine records are normalized into [`CanonicalEvent`]s by the event
//! ingestor. The state monitor turns canonical events into coarser
//! [`Notification`]s, which is what external listeners consume.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::container::ContainerState;
use crate::ids::{ContainerId, NodeId};

/// A container lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventAction {
    /// Container started.
    Start,
    /// Container stopped.
    Stop,
    /// Container restarted.
    Restart,
    /// Container's main process exited.
    Die,
    /// Container created.
    Create,
    /// Container removed.
    Destroy,
    /// Container paused.
    Pause,
    /// Container unpaused.
    Unpause,
    /// Health check status changed.
    HealthStatus,
    /// Synthetic: the container is changing state too often.
    Flapping,
    /// Synthetic: a snapshot diff found a state without a matching action.
    StateChanged(ContainerState),
}

impl EventAction {
    /// Parse an engine action string against the ingest allow-list.
    ///
    /// Actions carrying a detail suffix (`health_status: healthy`) are split
    /// into the action and the detail. Returns `None` for actions outside the
    /// allow-list.
    #[must_use]
    pub fn from_engine(raw: &str) -> Option<(Self, Option<String>)> {
        let (name, detail) = match raw.split_once(':') {
            Some((name, detail)) => (name.trim(), Some(detail.trim().to_string())),
            None => (raw.trim(), None),
        };
        let action = match name {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "die" => Self::Die,
            "create" => Self::Create,
            "destroy" => Self::Destroy,
            "pause" => Self::Pause,
            "unpause" => Self::Unpause,
            "health_status" => Self::HealthStatus,
            _ => return None,
        };
        Some((action, detail.filter(|d| !d.is_empty())))
    }

    /// Action name as used in notifications.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Die => "die",
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::HealthStatus => "health_status",
            Self::Flapping => "flapping",
            Self::StateChanged(state) => state.as_str(),
        }
    }

    /// Returns true for the actions subject to debounce.
    #[must_use]
    pub const fn is_debounced(&self) -> bool {
        matches!(self, Self::Start | Self::Stop)
    }

    /// The opposing debounced action, if any.
    #[must_use]
    pub const fn opposite(&self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::Stop),
            Self::Stop => Some(Self::Start),
            _ => None,
        }
    }

    /// Returns true if the action counts as a state transition for flapping detection.
    #[must_use]
    pub const fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Stop | Self::Die | Self::Restart | Self::StateChanged(_)
        )
    }

    /// The last-known state implied by this action, if it implies one.
    ///
    /// Health reports and synthetic actions leave the state untouched.
    #[must_use]
    pub const fn resulting_state(&self) -> Option<ContainerState> {
        match self {
            Self::Start | Self::Restart | Self::Unpause => Some(ContainerState::Running),
            Self::HealthStatus | Self::Flapping => None,
            Self::StateChanged(state) => Some(*state),
            Self::Stop | Self::Die | Self::Create | Self::Destroy | Self::Pause => {
                Some(ContainerState::Stopped)
            }
        }
    }

    /// Action synthesized from a snapshot diff between two states.
    #[must_use]
    pub fn from_transition(previous: ContainerState, current: ContainerState) -> Self {
        if current.is_running() {
            Self::Start
        } else if previous.is_running() {
            Self::Stop
        } else {
            Self::StateChanged(current)
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EventAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "flapping" {
            return Ok(Self::Flapping);
        }
        if let Some((action, _)) = Self::from_engine(&value) {
            return Ok(action);
        }
        match value.as_str() {
            "running" | "stopped" | "paused" | "restarting" | "created" => {
                Ok(Self::StateChanged(ContainerState::from_engine(&value)))
            }
            _ => Err(format!("unknown event action: {value}")),
        }
    }
}

impl From<EventAction> for String {
    fn from(action: EventAction) -> Self {
        action.as_str().to_string()
    }
}

/// A normalized, deduplicated container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Node the event came from.
    pub node_id: NodeId,
    /// Container the event is about.
    pub container_id: ContainerId,
    /// Container name without the leading `/`.
    pub container_name: String,
    /// Normalized action.
    pub action: EventAction,
    /// Image reference, when the engine reported one.
    pub image: Option<String>,
    /// Engine timestamp in nanoseconds since the Unix epoch.
    pub timestamp_nanos: i64,
    /// Remaining engine attributes (exit code, health, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CanonicalEvent {
    /// Key used to deduplicate repeated deliveries of the same record.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.container_id,
            self.action,
            self.timestamp_nanos
        )
    }

    /// Event timestamp as a UTC date-time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp_nanos)
    }
}

/// The kind of an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NotificationKind {
    /// The node connected.
    NodeOnline,
    /// The node disconnected or lost its session.
    NodeOffline,
    /// The node's API tunnel became unavailable; shell-exec fallback active.
    NodeDegraded,
    /// The node's API tunnel recovered.
    NodeRecovered,
    /// A container changed state.
    Container(EventAction),
}

impl NotificationKind {
    /// Dotted event type string, e.g. `node.online` or `container.die`.
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::NodeOnline => "node.online".to_string(),
            Self::NodeOffline => "node.offline".to_string(),
            Self::NodeDegraded => "node.degraded".to_string(),
            Self::NodeRecovered => "node.recovered".to_string(),
            Self::Container(action) => format!("container.{action}"),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl TryFrom<String> for NotificationKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "node.online" => Ok(Self::NodeOnline),
            "node.offline" => Ok(Self::NodeOffline),
            "node.degraded" => Ok(Self::NodeDegraded),
            "node.recovered" => Ok(Self::NodeRecovered),
            other => other
                .strip_prefix("container.")
                .ok_or_else(|| format!("unknown notification kind: {other}"))
                .and_then(|a| EventAction::try_from(a.to_string()))
                .map(Self::Container),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        kind.as_string()
    }
}

/// A processed notification delivered to external listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Event type.
    pub kind: NotificationKind,
    /// Node the notification concerns.
    pub node_id: NodeId,
    /// Node display name.
    pub node_name: String,
    /// Container ID, for container notifications.
    pub container_id: Option<ContainerId>,
    /// Container name, for container notifications.
    pub container_name: Option<String>,
    /// Action name (`online`, `die`, `flapping`, ...).
    pub action: String,
    /// Extra context (image, exit code, transition count, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// When the underlying event happened.
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Build a node-level notification.
    #[must_use]
    pub fn node(kind: NotificationKind, node_id: NodeId, node_name: impl Into<String>) -> Self {
        let action = match kind {
            NotificationKind::NodeOnline => "online",
            NotificationKind::NodeOffline => "offline",
            NotificationKind::NodeDegraded => "degraded",
            NotificationKind::NodeRecovered => "recovered",
            NotificationKind::Container(action) => action.as_str(),
        };
        Self {
            kind,
            node_id,
            node_name: node_name.into(),
            container_id: None,
            container_name: None,
            action: action.to_string(),
            attributes: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a container notification carrying the event's context.
    #[must_use]
    pub fn from_event(event: &CanonicalEvent, node_name: impl Into<String>) -> Self {
        let mut attributes = event.attributes.clone();
        if let Some(image) = &event.image {
            attributes.insert("image".to_string(), image.clone());
        }
        Self {
            kind: NotificationKind::Container(event.action),
            node_id: event.node_id.clone(),
            node_name: node_name.into(),
            container_id: Some(event.container_id.clone()),
            container_name: Some(event.container_name.clone()),
            action: event.action.as_str().to_string(),
            attributes,
            timestamp: event.timestamp(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
