//! Read snapshots of node records.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use crate::error::RegistryResult;
use crate::record::{Document, NodeRecord};
use crate::tags::{matches_tags, TagFilter, Tags};
use crate::Registry;

/// Metadata key holding a node's lifecycle state.
pub const STATE_KEY: &str = "state";

/// State reported when a node has never been given one.
pub const UNKNOWN_STATE: &str = "unknown";

/// An immutable snapshot of one node, taken at read time.
///
/// Snapshots never alias backend storage. Call [`NodeDoc::refresh`] to pick up
/// changes made after the read. Blobs are not copied into the snapshot; fetch
/// them with [`NodeDoc::get_blob`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDoc {
    record: NodeRecord,
}

impl NodeDoc {
    pub(crate) fn from_record(record: &NodeRecord) -> Self {
        let mut record = record.clone();
        record.blobs = Document::new();
        Self { record }
    }

    pub fn id(&self) -> &str {
        &self.record.node_id
    }

    pub fn node_type(&self) -> &str {
        &self.record.node_type
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn tenant(&self) -> Option<&str> {
        self.record.tenant.as_deref()
    }

    pub fn definition(&self) -> &Document {
        &self.record.definition
    }

    pub fn metadata(&self) -> &Document {
        &self.record.metadata
    }

    pub fn tags(&self) -> &Tags {
        &self.record.tags
    }

    pub fn unique_keys(&self) -> &BTreeSet<String> {
        &self.record.unique_keys
    }

    pub fn parent(&self) -> Option<&str> {
        self.record.parent.as_deref()
    }

    /// The `"state"` entry of the metadata, or `"unknown"`.
    pub fn state(&self) -> &str {
        self.record
            .metadata
            .get(STATE_KEY)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_STATE)
    }

    pub fn matches_tags(&self, required: &TagFilter) -> bool {
        matches_tags(&self.record.tags, required)
    }

    /// Fetch a blob for this node from the registry.
    pub fn get_blob(&self, registry: &dyn Registry, key: &str) -> RegistryResult<Option<Value>> {
        registry.get_blob(self.id(), key)
    }

    /// Replace this snapshot with the registry's current view of the node.
    pub fn refresh(&mut self, registry: &dyn Registry) -> RegistryResult<()> {
        *self = registry.get_node(self.id())?;
        Ok(())
    }
}

impl fmt::Display for NodeDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeDoc for {}", self.record.node_id)
    }
}
