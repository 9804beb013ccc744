//! Last-known container states per node.

use std::collections::HashMap;

use dockwarden_core::{ContainerId, ContainerState};
use parking_lot::Mutex;

/// Map of container ID to last known state, shared by the ingestor and the
/// monitor of one node.
#[derive(Debug, Default)]
pub struct KnownStates {
    states: Mutex<HashMap<ContainerId, ContainerState>>,
}

impl KnownStates {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known state of a container.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<ContainerState> {
        self.states.lock().get(id).copied()
    }

    /// Record a state and return the previous one.
    pub fn set(&self, id: ContainerId, state: ContainerState) -> Option<ContainerState> {
        self.states.lock().insert(id, state)
    }

    /// Drop every container not in `present`.
    pub fn retain_only(&self, present: &[ContainerId]) {
        self.states.lock().retain(|id, _| present.contains(id));
    }

    /// Number of tracked containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    /// Returns true if no container is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}
