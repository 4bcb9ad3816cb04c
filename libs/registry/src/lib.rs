//! # vagoth-registry
//!
//! The node registry is the single authority for node existence, identity and
//! placement. It stores hypervisors and virtual machines as generic nodes and
//! enforces:
//!
//! - node ids are unique and never overwritten
//! - names and caller-chosen unique keys map to exactly one node
//! - a node has at most one parent, and that parent exists
//! - a node with a parent or children cannot be deleted
//! - the unique-key index always points back at the node holding each key
//!
//! Failed operations leave the registry unchanged.
//!
//! ## Backends
//!
//! - [`MemoryRegistry`]: a mutex-guarded [`RegistryState`], single process
//! - [`FileRegistry`]: a JSON document guarded by a lock file
//! - [`SqliteRegistry`]: per-document revisions with optimistic retries
//!
//! All three are interchangeable behind the [`Registry`] trait and are
//! selected at startup from a [`RegistryConfig`].

mod config;
mod doc;
mod error;
mod file;
mod memory;
mod query;
mod record;
mod retry;
mod sqlite;
mod state;
mod tags;

use serde_json::Value;

pub use config::{open_registry, RegistryConfig};
pub use doc::{NodeDoc, STATE_KEY, UNKNOWN_STATE};
pub use error::{RegistryError, RegistryResult};
pub use file::FileRegistry;
pub use memory::MemoryRegistry;
pub use query::NodeQuery;
pub use record::{name_key, Document, NewNode, NodeRecord, NodeUpdate, NAME_KEY_PREFIX};
pub use retry::RetryPolicy;
pub use sqlite::SqliteRegistry;
pub use state::RegistryState;
pub use tags::{matches_tags, TagFilter, TagValue, Tags};

/// The registry contract shared by every backend.
///
/// Reads return value snapshots; nothing returned aliases backend storage.
/// Mutations are atomic with respect to each other.
pub trait Registry: Send + Sync {
    /// Is a node with this id registered?
    fn contains_node(&self, node_id: &str) -> RegistryResult<bool>;

    /// Ids of every registered node.
    fn list_nodes(&self) -> RegistryResult<Vec<String>>;

    fn get_node(&self, node_id: &str) -> RegistryResult<NodeDoc>;

    fn get_node_by_name(&self, name: &str) -> RegistryResult<NodeDoc>;

    /// Look a node up by any unique key, including a `NAME_` key.
    fn get_node_by_key(&self, key: &str) -> RegistryResult<NodeDoc>;

    /// Every node matching all filters in `query`.
    fn get_nodes(&self, query: &NodeQuery) -> RegistryResult<Vec<NodeDoc>>;

    /// Register a node, claiming its name and unique keys, or fail with no
    /// trace left behind.
    fn add_node(&self, node: NewNode) -> RegistryResult<()>;

    /// Change the supplied fields of an existing node.
    fn set_node(&self, node_id: &str, update: NodeUpdate) -> RegistryResult<()>;

    /// Set the parent if unset (or already equal), or clear it with `None`.
    fn set_parent(&self, node_id: &str, parent: Option<&str>) -> RegistryResult<()>;

    /// Merge `extra` into the metadata and delete `delete_keys`, atomically.
    fn update_metadata(
        &self,
        node_id: &str,
        extra: Document,
        delete_keys: &[String],
    ) -> RegistryResult<()>;

    /// Store a blob; `None` deletes it.
    fn set_blob(&self, node_id: &str, key: &str, value: Option<Value>) -> RegistryResult<()>;

    fn get_blob(&self, node_id: &str, key: &str) -> RegistryResult<Option<Value>>;

    /// Remove an unplaced node with no children, releasing all its keys.
    fn delete_node(&self, node_id: &str) -> RegistryResult<()>;

    /// Repair the unique-key index after a crash mid-update.
    fn cleanup_index(&self) -> RegistryResult<IndexRepair>;
}

/// What a [`Registry::cleanup_index`] pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRepair {
    /// Index entries removed because their node no longer holds the key.
    pub released: Vec<String>,
    /// Keys held by a node but missing from the index, now claimed again.
    pub reclaimed: Vec<String>,
    /// Keys claimed by two nodes; left for an operator.
    pub conflicts: Vec<String>,
    /// Abandoned node reservations removed.
    pub reservations_dropped: Vec<String>,
}

impl IndexRepair {
    /// Returns true if nothing needed fixing.
    pub fn is_clean(&self) -> bool {
        self.released.is_empty()
            && self.reclaimed.is_empty()
            && self.conflicts.is_empty()
            && self.reservations_dropped.is_empty()
    }
}
