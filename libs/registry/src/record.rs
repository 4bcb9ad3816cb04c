//! Persisted node records and the argument types for creating and updating them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RegistryError, RegistryResult};
use crate::tags::Tags;

/// Prefix of the synthetic unique key that enforces name uniqueness.
pub const NAME_KEY_PREFIX: &str = "NAME_";

/// Opaque JSON object used for definitions, metadata and blobs.
pub type Document = Map<String, Value>;

/// The synthetic unique key claimed for a node name.
pub fn name_key(name: &str) -> String {
    format!("{NAME_KEY_PREFIX}{name}")
}

/// One node as stored by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub definition: Document,
    #[serde(default)]
    pub metadata: Document,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub unique_keys: BTreeSet<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Document::is_empty")]
    pub blobs: Document,
}

impl NodeRecord {
    /// Every key this node holds in the unique index, name key included.
    pub fn claimed_keys(&self) -> BTreeSet<String> {
        let mut keys = self.unique_keys.clone();
        keys.insert(name_key(&self.name));
        keys
    }

    /// Merge `extra` into metadata and drop `delete_keys`.
    ///
    /// Deletions run first so a key both deleted and supplied ends up set.
    pub(crate) fn merge_metadata(&mut self, extra: &Document, delete_keys: &[String]) {
        for key in delete_keys {
            self.metadata.remove(key);
        }
        for (key, value) in extra {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Store a blob, or remove it when `value` is `None`.
    pub(crate) fn put_blob(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.blobs.insert(key.to_string(), value);
            }
            None => {
                self.blobs.remove(key);
            }
        }
    }

    /// Apply the non-key fields of an update. Name and unique keys are
    /// handled by the backend because they touch the index.
    pub(crate) fn apply_fields(&mut self, update: &NodeUpdate) {
        if let Some(tenant) = &update.tenant {
            self.tenant = Some(tenant.clone());
        }
        if let Some(definition) = &update.definition {
            self.definition = definition.clone();
        }
        if let Some(metadata) = &update.metadata {
            self.metadata = metadata.clone();
        }
        if let Some(tags) = &update.tags {
            self.tags = tags.clone();
        }
    }
}

/// A node to be added to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub tenant: Option<String>,
    pub definition: Document,
    pub metadata: Document,
    pub tags: Tags,
    pub unique_keys: BTreeSet<String>,
}

impl NewNode {
    pub fn new(
        node_id: impl Into<String>,
        name: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            node_type: node_type.into(),
            tenant: None,
            definition: Document::new(),
            metadata: Document::new(),
            tags: Tags::new(),
            unique_keys: BTreeSet::new(),
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn definition(mut self, definition: Document) -> Self {
        self.definition = definition;
        self
    }

    pub fn metadata(mut self, metadata: Document) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn unique_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// The record this node will be stored as.
    pub(crate) fn into_record(self) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id,
            node_type: self.node_type,
            name: self.name,
            tenant: self.tenant,
            definition: self.definition,
            metadata: self.metadata,
            tags: self.tags,
            unique_keys: self.unique_keys,
            parent: None,
            blobs: Document::new(),
        }
    }
}

/// A partial update: only the fields that are `Some` change.
///
/// `unique_keys` is the complete new key set; keys absent from it are released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub tenant: Option<String>,
    pub definition: Option<Document>,
    pub metadata: Option<Document>,
    pub tags: Option<Tags>,
    pub unique_keys: Option<BTreeSet<String>>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn definition(mut self, definition: Document) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn metadata(mut self, metadata: Document) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn unique_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// Reject caller keys that would collide with the synthetic name keys.
pub(crate) fn check_caller_keys<'a>(
    keys: impl IntoIterator<Item = &'a String>,
) -> RegistryResult<()> {
    for key in keys {
        if key.starts_with(NAME_KEY_PREFIX) {
            return Err(RegistryError::ReservedKey(key.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claimed_keys_include_name() {
        let record = NewNode::new("n1", "node001", "hv")
            .unique_keys(["ip-10.0.0.1"])
            .into_record();
        let keys = record.claimed_keys();
        assert!(keys.contains("NAME_node001"));
        assert!(keys.contains("ip-10.0.0.1"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_merge_metadata() {
        let mut record = NewNode::new("n1", "node001", "vm").into_record();
        record.metadata.insert("keep".into(), json!(1));
        record.metadata.insert("drop".into(), json!(2));

        let extra = json!({"new": 3}).as_object().cloned().unwrap();
        record.merge_metadata(&extra, &["drop".to_string()]);

        assert_eq!(record.metadata.get("keep"), Some(&json!(1)));
        assert_eq!(record.metadata.get("new"), Some(&json!(3)));
        assert!(!record.metadata.contains_key("drop"));
    }

    #[test]
    fn test_reserved_key_rejected() {
        let keys = ["NAME_sneaky".to_string()];
        assert!(matches!(
            check_caller_keys(keys.iter()),
            Err(RegistryError::ReservedKey(_))
        ));
    }

    #[test]
    fn test_record_json_shape() {
        let record = NewNode::new("n1", "node001", "hv").into_record();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "hv");
        assert_eq!(value["parent"], serde_json::Value::Null);
        assert!(value.get("blobs").is_none());
    }
}
