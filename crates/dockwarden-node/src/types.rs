//! Connection state types.

use dockwarden_transport::TransportMode;
use serde::{Deserialize, Serialize};

/// Connection status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session and no attempt in flight.
    #[default]
    Disconnected,
    /// A connect attempt (or retry loop) is in flight.
    Connecting,
    /// A transport is open.
    Connected,
    /// The session failed; reconnection is about to start.
    Error,
}

impl ConnectionStatus {
    /// Lower-case name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readable diagnostics for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Connection status.
    pub status: ConnectionStatus,
    /// How engine operations are currently carried.
    pub transport_mode: TransportMode,
    /// True while the API tunnel is down and shell-exec is in use.
    pub degraded: bool,
    /// Consecutive failed connect attempts.
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            transport_mode: TransportMode::Unknown,
            degraded: false,
            reconnect_attempts: 0,
        }
    }
}
