//! The set of managed nodes.

use std::collections::HashMap;
use std::sync::Arc;

use dockwarden_core::{CanonicalEvent, Credential, NodeDescriptor, NodeId, Notification};
use dockwarden_transport::Connector;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::node::NodeConnection;
use crate::types::ConnectionState;

/// Registry of node connections sharing one notification bus.
pub struct Fleet {
    connector: Arc<dyn Connector>,
    config: NodeConfig,
    nodes: RwLock<HashMap<NodeId, Arc<NodeConnection>>>,
    bus: Arc<EventBus<Notification>>,
    raw_bus: Arc<EventBus<CanonicalEvent>>,
}

impl Fleet {
    /// Create an empty fleet.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: NodeConfig) -> Self {
        Self {
            connector,
            config,
            nodes: RwLock::new(HashMap::new()),
            bus: EventBus::new(),
            raw_bus: EventBus::new(),
        }
    }

    /// Add a node. It starts disconnected.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if the ID is already registered.
    pub fn register(&self, descriptor: NodeDescriptor, credential: Credential) -> Result<Arc<NodeConnection>> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&descriptor.id) {
            return Err(NodeError::DuplicateNode(descriptor.id));
        }
        let id = descriptor.id.clone();
        let node = NodeConnection::new(
            descriptor,
            credential,
            self.config.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.bus),
            Arc::clone(&self.raw_bus),
        );
        nodes.insert(id.clone(), Arc::clone(&node));
        info!(node_id = %id, "Node registered");
        Ok(node)
    }

    /// Disconnect and forget a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the ID is not registered.
    pub async fn remove(&self, id: &NodeId) -> Result<()> {
        let node = self
            .nodes
            .write()
            .remove(id)
            .ok_or_else(|| NodeError::NodeNotFound(id.clone()))?;
        node.disconnect().await;
        info!(node_id = %id, "Node removed");
        Ok(())
    }

    /// Look up a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the ID is not registered.
    pub fn get(&self, id: &NodeId) -> Result<Arc<NodeConnection>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::NodeNotFound(id.clone()))
    }

    /// All nodes, ordered by ID.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<NodeConnection>> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Start connecting every node in the background.
    pub fn connect_all(&self) {
        for node in self.nodes() {
            tokio::spawn(async move {
                if let Err(e) = node.connect().await {
                    warn!(node_id = %node.id(), error = %e, "Connect abandoned");
                }
            });
        }
    }

    /// Disconnect every node.
    pub async fn disconnect_all(&self) {
        let nodes = self.nodes();
        join_all(nodes.iter().map(|node| node.disconnect())).await;
    }

    /// Diagnostics for every node.
    #[must_use]
    pub fn states(&self) -> Vec<(NodeId, ConnectionState)> {
        self.nodes()
            .iter()
            .map(|node| (node.id().clone(), node.state()))
            .collect()
    }

    /// Register a callback for notifications from every node.
    pub fn on_event(&self, callback: impl Fn(&Notification) + Send + Sync + 'static) -> Subscription {
        self.bus.subscribe(callback)
    }

    /// Register a callback for canonical events from every node.
    pub fn on_raw_event(&self, callback: impl Fn(&CanonicalEvent) + Send + Sync + 'static) -> Subscription {
        self.raw_bus.subscribe(callback)
    }
}
