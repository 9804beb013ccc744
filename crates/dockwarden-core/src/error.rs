//! Common error types for dockwarden.
//!
//! This module provides shared error types that are used across multiple crates.

use crate::ids::NodeId;
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the dockwarden system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A node with the specified ID was not found.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A node descriptor is missing required information.
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
