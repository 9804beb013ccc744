//! Transport layer for dockwarden.
//!
//! This crate opens the command channel to a node's container engine and
//! keeps it working:
//!
//! - [`SshShell`] keeps one SSH control-master session per node
//! - [`ApiTunnel`] speaks the engine HTTP API through that session
//! - [`CliEngine`] falls back to engine CLI commands over the shell
//! - [`NodeTransport`] routes operations between the two and tracks
//!   degradation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      NodeTransport                        │
//! │   mode: api-tunnel | shell-exec        degraded: bool     │
//! │          │                                   │            │
//! │          ▼                                   ▼            │
//! │   ┌─────────────┐  ApiUnavailable   ┌─────────────┐       │
//! │   │  ApiTunnel  │ ────────────────▶ │  CliEngine  │       │
//! │   │ (HTTP/1.1)  │                   │ (ps, inspect│       │
//! │   └─────────────┘                   │  logs, ...) │       │
//! │          │ dial-stdio               └─────────────┘       │
//! │          ▼                                   │            │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │        RemoteShell (SSH control master)           │   │
//! │   └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use dockwarden_transport::{Connector, SshConnector, TransportConfig};
//!
//! let connector = SshConnector::new(TransportConfig::default());
//! let transport = connector.open(&node, &credential).await?;
//! for container in transport.list_containers(true).await? {
//!     println!("{} {}", container.name(), container.state);
//! }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for in-memory [`mock::MockEngine`],
//! [`mock::MockShell`] and [`mock::MockConnector`] implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cli;
mod config;
mod connector;
mod engine;
mod error;
pub mod framing;
pub mod paths;
mod shell;
mod ssh;
mod transport;
mod tunnel;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cli::CliEngine;
pub use config::TransportConfig;
pub use connector::{Connector, SshConnector};
pub use engine::{endpoint_for_create, format_size, split_image_ref, EngineApi};
pub use error::{Result, TransportError};
pub use shell::{check_output, classify_ssh_failure, shell_join, shell_quote, LocalShell, RemoteShell};
pub use ssh::SshShell;
pub use transport::NodeTransport;
pub use tunnel::{ApiTunnel, Dialer, ShellDialer, UnixSocketDialer};
pub use types::{
    ByteStream, CommandOutput, DuplexIo, EventFilter, ExecOptions, StreamCancel, StreamOpen,
    TransportMode,
};
