//! Core types and utilities for dockwarden.
//!
//! This crate provides the foundational types shared by the transport and
//! node crates:
//!
//! - **Identifiers**: Strongly-typed IDs for nodes and containers
//! - **Node descriptors**: Static node configuration and credentials
//! - **Container models**: Snapshots and inspect details normalized from the engine
//! - **Events**: Canonical container events and outbound notifications
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use dockwarden_core::{Credential, NodeDescriptor, NodeId};
//!
//! let node_id = NodeId::new("edge-01").unwrap();
//! let node = NodeDescriptor::new(node_id, "Edge 01", "10.0.0.12", "deploy");
//! let credential = Credential::password("s3cret");
//!
//! assert_eq!(node.address.port, 22);
//! assert!(!node.is_local());
//! # let _ = credential;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod container;
pub mod error;
pub mod event;
pub mod ids;
pub mod node;

pub use container::{
    ContainerDetails, ContainerSnapshot, ContainerState, ExecOutput, ImageSummary,
    NetworkSummary, VolumeSummary,
};
pub use error::{CoreError, Result};
pub use event::{CanonicalEvent, EventAction, Notification, NotificationKind};
pub use ids::{ContainerId, IdError, NodeId};
pub use node::{sanitize_port, Credential, NodeAddress, NodeDescriptor, DEFAULT_SSH_PORT};
