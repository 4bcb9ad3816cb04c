//! Registry error types.

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from registry operations.
///
/// Not-found and constraint errors leave the registry unchanged. `Contention`
/// means the backend could not commit after bounded retries; the caller should
/// re-read the node before deciding what to do next.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No node matched the lookup.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node with this id is already registered.
    #[error("node already exists in registry: {0}")]
    NodeAlreadyExists(String),

    /// A name or unique key is already claimed by another node.
    #[error("unique key {key} is already claimed by node {owner}")]
    UniqueConstraintViolation { key: String, owner: String },

    /// The node is placed on a different parent; clear it first.
    #[error("node {node_id} already has parent {parent}; unassign it first")]
    NodeAlreadyHasParent { node_id: String, parent: String },

    /// The node still has a parent or children.
    #[error("node {node_id} is still in use: {reason}")]
    NodeStillUsed { node_id: String, reason: String },

    /// A node cannot be its own parent.
    #[error("node {0} cannot be its own parent")]
    InvalidParent(String),

    /// Caller-supplied unique keys may not use the name-key namespace.
    #[error("unique key {0} uses the reserved name prefix")]
    ReservedKey(String),

    /// Optimistic writes kept conflicting until the retry budget ran out.
    #[error("could not commit {operation} for node {node_id} after {attempts} attempts")]
    Contention {
        operation: &'static str,
        node_id: String,
        attempts: u32,
    },

    /// Filesystem failure in the file backend.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted document could not be encoded or decoded.
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite failure in the document-store backend.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A writer panicked while holding the registry lock.
    #[error("registry lock poisoned")]
    Poisoned,
}

impl RegistryError {
    /// Returns true if this error means the node (or its parent) was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_))
    }

    /// Returns true if the operation was rejected to protect an invariant.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::NodeAlreadyExists(_)
                | Self::UniqueConstraintViolation { .. }
                | Self::NodeAlreadyHasParent { .. }
                | Self::InvalidParent(_)
                | Self::ReservedKey(_)
        )
    }

    /// Returns true if the node's state is uncertain and should be re-read.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}
