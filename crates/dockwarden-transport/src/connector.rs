//! Opening transports for nodes.

use std::sync::Arc;

use async_trait::async_trait;
use dockwarden_core::{Credential, NodeDescriptor};
use tracing::{info, instrument};

use crate::cli::CliEngine;
use crate::config::TransportConfig;
use crate::engine::EngineApi;
use crate::error::Result;
use crate::shell::{LocalShell, RemoteShell};
use crate::ssh::SshShell;
use crate::transport::NodeTransport;
use crate::tunnel::{ApiTunnel, Dialer, ShellDialer, UnixSocketDialer};

/// Opens a [`NodeTransport`] for a node.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and probe a transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be established or the engine
    /// does not answer.
    async fn open(&self, node: &NodeDescriptor, credential: &Credential) -> Result<Arc<NodeTransport>>;
}

/// Production connector: local socket for the local machine, SSH otherwise.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: TransportConfig,
}

impl SshConnector {
    /// Create a connector with the given settings.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip_all, fields(node_id = %node.id))]
    async fn open(&self, node: &NodeDescriptor, credential: &Credential) -> Result<Arc<NodeTransport>> {
        let (shell, dialer): (Arc<dyn RemoteShell>, Arc<dyn Dialer>) = if node.is_local() {
            let shell: Arc<dyn RemoteShell> = Arc::new(LocalShell::new(self.config.command_timeout()));
            let dialer = Arc::new(UnixSocketDialer::new(self.config.engine_socket.clone()));
            (shell, dialer)
        } else {
            let shell: Arc<dyn RemoteShell> =
                Arc::new(SshShell::connect(node, credential, self.config.clone()).await?);
            let dialer = Arc::new(ShellDialer::new(Arc::clone(&shell), self.config.dial_command()));
            (shell, dialer)
        };

        let api: Option<Arc<dyn EngineApi>> = if self.config.shell_only {
            None
        } else {
            Some(Arc::new(ApiTunnel::new(dialer)))
        };
        let cli: Arc<dyn EngineApi> = Arc::new(CliEngine::new(Arc::clone(&shell), &self.config));

        let transport = Arc::new(NodeTransport::new(
            shell.label().to_string(),
            Arc::clone(&shell),
            api,
            cli,
        ));
        if let Err(e) = transport.probe().await {
            shell.close().await;
            return Err(e);
        }

        info!(mode = %transport.mode(), degraded = transport.is_degraded(), "Transport open");
        Ok(transport)
    }
}
