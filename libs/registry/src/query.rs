//! Node list filters.

use crate::record::NodeRecord;
use crate::tags::{matches_tags, TagFilter, TagValue};

/// Filters for [`Registry::get_nodes`](crate::Registry::get_nodes).
///
/// Every supplied filter must match; omitted filters match everything. The
/// tenant and parent filters distinguish "not filtered" (`None`) from
/// "must be unset" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeQuery {
    pub tenant: Option<Option<String>>,
    pub node_type: Option<String>,
    pub tags: Option<TagFilter>,
    pub parent: Option<Option<String>>,
}

impl NodeQuery {
    /// A query matching every node.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(Some(tenant.into()));
        self
    }

    pub fn without_tenant(mut self) -> Self {
        self.tenant = Some(None);
        self
    }

    pub fn node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    /// Require a tag; `None` only checks that it is present.
    pub fn tag(mut self, name: impl Into<String>, value: Option<TagValue>) -> Self {
        self.tags
            .get_or_insert_with(TagFilter::new)
            .insert(name.into(), value);
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(Some(parent.into()));
        self
    }

    pub fn unparented(mut self) -> Self {
        self.parent = Some(None);
        self
    }

    pub(crate) fn matches(&self, record: &NodeRecord) -> bool {
        if let Some(tenant) = &self.tenant {
            if record.tenant != *tenant {
                return false;
            }
        }
        if let Some(node_type) = &self.node_type {
            if record.node_type != *node_type {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if record.parent != *parent {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !matches_tags(&record.tags, tags) {
                return false;
            }
        }
        true
    }
}
