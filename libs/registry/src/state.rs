//! The node table and unique-key index, with every invariant enforced.
//!
//! `RegistryState` is a plain value: the in-memory backend keeps one behind a
//! mutex and the file backend loads one per operation. Each mutating method
//! validates everything before touching anything, so a failed call leaves the
//! state exactly as it was.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::doc::NodeDoc;
use crate::error::{RegistryError, RegistryResult};
use crate::query::NodeQuery;
use crate::record::{check_caller_keys, name_key, Document, NewNode, NodeRecord, NodeUpdate};
use crate::IndexRepair;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryState {
    /// Node records by node id.
    pub nodes: BTreeMap<String, NodeRecord>,
    /// Unique key (including `NAME_` keys) to owning node id.
    pub unique: BTreeMap<String, String>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, node_id: &str) -> RegistryResult<&NodeRecord> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    fn record_mut(&mut self, node_id: &str) -> RegistryResult<&mut NodeRecord> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn list_nodes(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn get_node(&self, node_id: &str) -> RegistryResult<NodeDoc> {
        self.record(node_id).map(NodeDoc::from_record)
    }

    pub fn get_node_by_name(&self, name: &str) -> RegistryResult<NodeDoc> {
        self.get_node_by_key(&name_key(name))
            .map_err(|_| RegistryError::NodeNotFound(format!("name {name}")))
    }

    pub fn get_node_by_key(&self, key: &str) -> RegistryResult<NodeDoc> {
        self.unique
            .get(key)
            .and_then(|node_id| self.nodes.get(node_id))
            .map(NodeDoc::from_record)
            .ok_or_else(|| RegistryError::NodeNotFound(format!("key {key}")))
    }

    pub fn get_nodes(&self, query: &NodeQuery) -> Vec<NodeDoc> {
        self.nodes
            .values()
            .filter(|record| query.matches(record))
            .map(NodeDoc::from_record)
            .collect()
    }

    pub fn get_blob(&self, node_id: &str, key: &str) -> RegistryResult<Option<Value>> {
        Ok(self.record(node_id)?.blobs.get(key).cloned())
    }

    /// Fail unless every key is free or already held by `node_id`.
    fn check_claimable<'a>(
        &self,
        node_id: &str,
        keys: impl IntoIterator<Item = &'a String>,
    ) -> RegistryResult<()> {
        for key in keys {
            if let Some(owner) = self.unique.get(key) {
                if owner != node_id {
                    return Err(RegistryError::UniqueConstraintViolation {
                        key: key.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop an index entry, but only if `node_id` still owns it.
    fn release(&mut self, node_id: &str, key: &str) {
        if self.unique.get(key).is_some_and(|owner| owner == node_id) {
            self.unique.remove(key);
        }
    }

    pub fn add_node(&mut self, node: NewNode) -> RegistryResult<()> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(RegistryError::NodeAlreadyExists(node.node_id));
        }
        check_caller_keys(&node.unique_keys)?;

        let record = node.into_record();
        let keys = record.claimed_keys();
        self.check_claimable(&record.node_id, &keys)?;

        for key in keys {
            self.unique.insert(key, record.node_id.clone());
        }
        self.nodes.insert(record.node_id.clone(), record);
        Ok(())
    }

    pub fn set_node(&mut self, node_id: &str, update: NodeUpdate) -> RegistryResult<()> {
        let current = self.record(node_id)?;
        let rename = update
            .name
            .as_ref()
            .filter(|name| **name != current.name)
            .map(|name| (name_key(&current.name), name_key(name)));

        if let Some(keys) = &update.unique_keys {
            check_caller_keys(keys)?;
            self.check_claimable(node_id, keys)?;
        }
        if let Some((_, new_key)) = &rename {
            self.check_claimable(node_id, [new_key])?;
        }

        // Everything validated: commit.
        if let Some(keys) = &update.unique_keys {
            let old_keys = std::mem::take(&mut self.record_mut(node_id)?.unique_keys);
            for key in old_keys.difference(keys) {
                self.release(node_id, key);
            }
            for key in keys {
                self.unique.insert(key.clone(), node_id.to_string());
            }
        }
        if let Some((old_key, new_key)) = rename {
            self.release(node_id, &old_key);
            self.unique.insert(new_key, node_id.to_string());
        }

        let record = self.record_mut(node_id)?;
        record.apply_fields(&update);
        if let Some(keys) = update.unique_keys {
            record.unique_keys = keys;
        }
        if let Some(name) = update.name {
            record.name = name;
        }
        Ok(())
    }

    pub fn set_parent(&mut self, node_id: &str, parent: Option<&str>) -> RegistryResult<()> {
        let current = self.record(node_id)?.parent.clone();

        let Some(parent) = parent else {
            self.record_mut(node_id)?.parent = None;
            return Ok(());
        };

        if parent == node_id {
            return Err(RegistryError::InvalidParent(node_id.to_string()));
        }
        if !self.nodes.contains_key(parent) {
            return Err(RegistryError::NodeNotFound(parent.to_string()));
        }
        match current {
            Some(existing) if existing == parent => Ok(()),
            Some(existing) => Err(RegistryError::NodeAlreadyHasParent {
                node_id: node_id.to_string(),
                parent: existing,
            }),
            None => {
                self.record_mut(node_id)?.parent = Some(parent.to_string());
                Ok(())
            }
        }
    }

    pub fn update_metadata(
        &mut self,
        node_id: &str,
        extra: &Document,
        delete_keys: &[String],
    ) -> RegistryResult<()> {
        self.record_mut(node_id)?.merge_metadata(extra, delete_keys);
        Ok(())
    }

    pub fn set_blob(&mut self, node_id: &str, key: &str, value: Option<Value>) -> RegistryResult<()> {
        self.record_mut(node_id)?.put_blob(key, value);
        Ok(())
    }

    /// Nodes whose parent is `node_id`.
    pub fn children_of(&self, node_id: &str) -> usize {
        self.nodes
            .values()
            .filter(|record| record.parent.as_deref() == Some(node_id))
            .count()
    }

    pub fn delete_node(&mut self, node_id: &str) -> RegistryResult<()> {
        let record = self.record(node_id)?;
        if let Some(parent) = &record.parent {
            return Err(RegistryError::NodeStillUsed {
                node_id: node_id.to_string(),
                reason: format!("still placed on {parent}"),
            });
        }
        let children = self.children_of(node_id);
        if children > 0 {
            return Err(RegistryError::NodeStillUsed {
                node_id: node_id.to_string(),
                reason: format!("{children} node(s) still name it as parent"),
            });
        }

        let keys = record.claimed_keys();
        for key in &keys {
            self.release(node_id, key);
        }
        self.nodes.remove(node_id);
        Ok(())
    }

    /// Describe every way the index disagrees with the node table.
    pub fn index_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (key, owner) in &self.unique {
            match self.nodes.get(owner) {
                None => violations.push(format!("{key} points at missing node {owner}")),
                Some(record) if !record.claimed_keys().contains(key) => {
                    violations.push(format!("{key} points at {owner}, which does not hold it"))
                }
                Some(_) => {}
            }
        }
        for record in self.nodes.values() {
            for key in record.claimed_keys() {
                match self.unique.get(&key) {
                    Some(owner) if *owner == record.node_id => {}
                    Some(owner) => violations.push(format!(
                        "{key} held by {} but indexed to {owner}",
                        record.node_id
                    )),
                    None => violations.push(format!(
                        "{key} held by {} but missing from index",
                        record.node_id
                    )),
                }
            }
        }
        violations
    }

    /// Bring the index back in line with the node table.
    ///
    /// Entries pointing at missing nodes, or at nodes that no longer hold the
    /// key, are dropped. Keys a node holds but the index lacks are re-claimed.
    /// A key held by two nodes cannot be fixed here and is reported.
    pub fn repair_index(&mut self) -> IndexRepair {
        let mut repair = IndexRepair::default();

        let stale: Vec<String> = self
            .unique
            .iter()
            .filter(|(key, owner)| {
                self.nodes
                    .get(*owner)
                    .is_none_or(|record| !record.claimed_keys().contains(*key))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.unique.remove(&key);
            repair.released.push(key);
        }

        for record in self.nodes.values() {
            for key in record.claimed_keys() {
                match self.unique.get(&key) {
                    Some(owner) if *owner == record.node_id => {}
                    Some(owner) => repair.conflicts.push(format!(
                        "{key} held by {} and {owner}",
                        record.node_id
                    )),
                    None => {
                        self.unique.insert(key.clone(), record.node_id.clone());
                        repair.reclaimed.push(key);
                    }
                }
            }
        }

        repair
    }
}
