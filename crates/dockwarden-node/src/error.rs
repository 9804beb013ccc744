//! Error types for node management.

use dockwarden_core::NodeId;
use dockwarden_transport::TransportError;
use thiserror::Error;

use crate::types::ConnectionStatus;

/// A result type using `NodeError`.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The requested node is not registered.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node with this ID is already registered.
    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    /// The node has no open transport.
    #[error("node {0} is not connected")]
    NotConnected(NodeId),

    /// The requested status transition is not valid.
    #[error("invalid status transition for node {node_id}: cannot transition from {from} to {to}")]
    InvalidState {
        /// The node being transitioned.
        node_id: NodeId,
        /// The current status.
        from: ConnectionStatus,
        /// The requested status.
        to: ConnectionStatus,
    },

    /// A connect attempt was abandoned because the node was torn down.
    #[error("connect to node {0} was cancelled")]
    Cancelled(NodeId),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] dockwarden_core::CoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::NotConnected(_) | Self::Cancelled(_) => true,
            Self::Transport(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Returns true if the error reports a missing object (node or container).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_) | Self::Transport(TransportError::NotFound(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let id = NodeId::new("n1").unwrap();
        assert!(NodeError::NotConnected(id.clone()).is_retriable());
        assert!(NodeError::Transport(TransportError::Channel("x".into())).is_retriable());
        assert!(!NodeError::DuplicateNode(id.clone()).is_retriable());
        assert!(NodeError::NodeNotFound(id.clone()).is_not_found());
        assert!(NodeError::Transport(TransportError::NotFound("c".into())).is_not_found());

        let err = NodeError::InvalidState {
            node_id: id,
            from: ConnectionStatus::Disconnected,
            to: ConnectionStatus::Connected,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for node n1: cannot transition from disconnected to connected"
        );
    }
}
