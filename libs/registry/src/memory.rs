//! In-memory registry backend.

use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::{
    Document, IndexRepair, NewNode, NodeDoc, NodeQuery, NodeUpdate, Registry, RegistryState,
};

/// A thread-safe (not process-safe) registry held entirely in memory.
///
/// One coarse lock serializes every operation.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, e.g. one loaded from a snapshot.
    pub fn from_state(state: RegistryState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> RegistryResult<RegistryState> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| RegistryError::Poisoned)
    }
}

impl Registry for MemoryRegistry {
    fn contains_node(&self, node_id: &str) -> RegistryResult<bool> {
        Ok(self.lock()?.contains(node_id))
    }

    fn list_nodes(&self) -> RegistryResult<Vec<String>> {
        Ok(self.lock()?.list_nodes())
    }

    fn get_node(&self, node_id: &str) -> RegistryResult<NodeDoc> {
        self.lock()?.get_node(node_id)
    }

    fn get_node_by_name(&self, name: &str) -> RegistryResult<NodeDoc> {
        self.lock()?.get_node_by_name(name)
    }

    fn get_node_by_key(&self, key: &str) -> RegistryResult<NodeDoc> {
        self.lock()?.get_node_by_key(key)
    }

    fn get_nodes(&self, query: &NodeQuery) -> RegistryResult<Vec<NodeDoc>> {
        Ok(self.lock()?.get_nodes(query))
    }

    fn add_node(&self, node: NewNode) -> RegistryResult<()> {
        let node_id = node.node_id.clone();
        self.lock()?.add_node(node)?;
        debug!(node_id = %node_id, "Node added");
        Ok(())
    }

    fn set_node(&self, node_id: &str, update: NodeUpdate) -> RegistryResult<()> {
        self.lock()?.set_node(node_id, update)
    }

    fn set_parent(&self, node_id: &str, parent: Option<&str>) -> RegistryResult<()> {
        self.lock()?.set_parent(node_id, parent)?;
        debug!(node_id = %node_id, parent = ?parent, "Parent set");
        Ok(())
    }

    fn update_metadata(
        &self,
        node_id: &str,
        extra: Document,
        delete_keys: &[String],
    ) -> RegistryResult<()> {
        self.lock()?.update_metadata(node_id, &extra, delete_keys)
    }

    fn set_blob(&self, node_id: &str, key: &str, value: Option<Value>) -> RegistryResult<()> {
        self.lock()?.set_blob(node_id, key, value)
    }

    fn get_blob(&self, node_id: &str, key: &str) -> RegistryResult<Option<Value>> {
        self.lock()?.get_blob(node_id, key)
    }

    fn delete_node(&self, node_id: &str) -> RegistryResult<()> {
        self.lock()?.delete_node(node_id)?;
        debug!(node_id = %node_id, "Node deleted");
        Ok(())
    }

    fn cleanup_index(&self) -> RegistryResult<IndexRepair> {
        Ok(self.lock()?.repair_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(MemoryRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.add_node(
                        NewNode::new(format!("vm{i}"), format!("vm{i}"), "vm")
                            .unique_keys(["mac-aa:bb:cc:dd:ee:ff"]),
                    )
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.list_nodes().unwrap().len(), 1);
        assert!(registry.snapshot().unwrap().index_violations().is_empty());
    }
}
