//! Node management for dockwarden.
//!
//! This crate keeps a fleet of nodes connected and turns their engine event
//! feeds into notifications:
//!
//! - [`Fleet`] registers nodes and shares one notification bus between them
//! - [`NodeConnection`] runs the connect/retry lifecycle of one node
//! - [`EventIngestor`] parses, deduplicates and forwards engine events
//! - [`StateMonitor`] debounces start/stop pairs and detects flapping
//! - [`HealthController`] polls over shell-exec while the API tunnel is down
//! - [`recreate`](NodeConnection::recreate) replaces a container and rolls
//!   back on failure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── NodeConnection ────────────────────────────┐
//! │  disconnected ─► connecting ─► connected ─► error ─► connecting ...    │
//! │                    ▲  │ backoff                                        │
//! │                    └──┘                                                │
//! │                                                                        │
//! │  NodeTransport ──events──► EventIngestor ──► StateMonitor ──► EventBus │
//! │        │                                         ▲                     │
//! │        └──degraded──► HealthController ──poll────┘                     │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dockwarden_node::{Fleet, NodeConfig};
//! use dockwarden_transport::{SshConnector, TransportConfig};
//!
//! let fleet = Fleet::new(Arc::new(SshConnector::new(TransportConfig::default())), NodeConfig::default());
//! fleet.register(descriptor, credential)?;
//! let _sub = fleet.on_event(|n| println!("{} {}", n.node_name, n.kind));
//! fleet.connect_all();
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature to pull in the transport mocks; the
//! scenarios under `tests/` drive whole nodes against them with paused time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod bus;
mod config;
mod error;
mod fleet;
mod health;
mod ingest;
pub mod lifecycle;
mod monitor;
mod node;
mod reconnect;
mod recreate;
mod state;
mod types;

pub use bus::{Callback, EventBus, Subscription};
pub use config::{
    HealthConfig, IngestConfig, MonitorConfig, NodeConfig, ReconnectConfig, RecreateConfig,
};
pub use error::{NodeError, Result};
pub use fleet::Fleet;
pub use health::HealthController;
pub use ingest::{parse_event, DedupCache, EventIngestor};
pub use monitor::StateMonitor;
pub use node::NodeConnection;
pub use reconnect::ReconnectManager;
pub use recreate::{
    backup_name, create_body, merge_env, RecreateOptions, RecreateResult, RollbackStatus,
};
pub use state::KnownStates;
pub use types::{ConnectionState, ConnectionStatus};
