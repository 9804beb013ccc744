//! Node connection state machine.
//!
//! # State Machine
//!
//! ```text
//!                     connect
//!  ┌──────────────┐ ─────────▶ ┌────────────┐  open ok  ┌───────────┐
//!  │ Disconnected │            │ Connecting │ ────────▶ │ Connected │
//!  └──────────────┘ ◀───────── └────────────┘           └─────┬─────┘
//!     ▲    ▲        disconnect        ▲                       │
//!     │    │                          │ retry                 │ session lost
//!     │    │      disconnect     ┌────┴────┐                  │
//!     │    └─────────────────────│  Error  │◀─────────────────┘
//!     │                          └─────────┘
//!     └──────────── disconnect (from Connected) ──────────────┘
//! ```
//!
//! There is no terminal failure state: a node stays `Connecting` until it
//! succeeds or is explicitly disconnected.

use dockwarden_core::NodeId;

use crate::error::{NodeError, Result};
use crate::types::ConnectionStatus;

/// Validates a status transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `NodeError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    node_id: &NodeId,
    from: ConnectionStatus,
    to: ConnectionStatus,
) -> Result<ConnectionStatus> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(NodeError::InvalidState {
            node_id: node_id.clone(),
            from,
            to,
        })
    }
}

/// Check if a status transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::{Connected, Connecting, Disconnected, Error};

    matches!(
        (from, to),
        (Disconnected | Error, Connecting)
            | (Connecting, Connected)
            | (Connecting | Connected | Error, Disconnected)
            | (Connected, Error)
    )
}

/// Returns true if the node has an open transport.
#[must_use]
pub const fn is_online(status: ConnectionStatus) -> bool {
    matches!(status, ConnectionStatus::Connected)
}

/// Returns true if a connect attempt may start from this status.
#[must_use]
pub const fn can_connect(status: ConnectionStatus) -> bool {
    is_valid_transition(status, ConnectionStatus::Connecting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use ConnectionStatus::*;

        assert!(is_valid_transition(Disconnected, Connecting));
        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connecting, Disconnected));
        assert!(is_valid_transition(Connected, Disconnected));
        assert!(is_valid_transition(Connected, Error));
        assert!(is_valid_transition(Error, Connecting));
        assert!(is_valid_transition(Error, Disconnected));
    }

    #[test]
    fn invalid_transitions() {
        use ConnectionStatus::*;

        assert!(!is_valid_transition(Disconnected, Connected));
        assert!(!is_valid_transition(Connecting, Connecting));
        assert!(!is_valid_transition(Connected, Connecting));
        assert!(!is_valid_transition(Connecting, Error));
        assert!(!is_valid_transition(Error, Connected));
        assert!(!is_valid_transition(Disconnected, Disconnected));
    }

    #[test]
    fn validate_returns_typed_error() {
        let id = NodeId::new("n1").unwrap();
        assert_eq!(
            validate_transition(&id, ConnectionStatus::Error, ConnectionStatus::Connecting).unwrap(),
            ConnectionStatus::Connecting
        );
        assert!(matches!(
            validate_transition(&id, ConnectionStatus::Disconnected, ConnectionStatus::Error),
            Err(NodeError::InvalidState { .. })
        ));
    }

    #[test]
    fn helpers() {
        assert!(is_online(ConnectionStatus::Connected));
        assert!(!is_online(ConnectionStatus::Connecting));
        assert!(can_connect(ConnectionStatus::Disconnected));
        assert!(can_connect(ConnectionStatus::Error));
        assert!(!can_connect(ConnectionStatus::Connecting));
    }
}
