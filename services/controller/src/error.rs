//! Controller error types.

use std::time::Duration;

use thiserror::Error;
use vagoth_registry::RegistryError;

use crate::node::NodeKind;

/// Result type for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// A hypervisor backend failed or did not answer.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No response from the hypervisor.
    #[error("hypervisor {hypervisor} unreachable: {reason}")]
    Unreachable { hypervisor: String, reason: String },

    /// The hypervisor answered with an error.
    #[error("{operation} failed on {hypervisor}: {message}")]
    Failed {
        hypervisor: String,
        operation: &'static str,
        message: String,
    },

    /// The call did not complete in time.
    #[error("{operation} on {hypervisor} timed out after {timeout:?}")]
    Timeout {
        hypervisor: String,
        operation: &'static str,
        timeout: Duration,
    },

    /// The driver does not implement this operation.
    #[error("driver {driver} does not support {operation}")]
    Unsupported {
        driver: &'static str,
        operation: &'static str,
    },
}

/// Node creation or removal was refused.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The provisioner declined the request.
    #[error("provisioning of {node_id} rejected: {reason}")]
    Rejected { node_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// A node's type has no entry in the node type table.
    #[error("node {node_id} has unknown type {node_type}")]
    UnknownNodeType { node_id: String, node_type: String },

    /// A hypervisor names a driver that was never configured.
    #[error("no driver configured with name {0}")]
    UnknownDriver(String),

    /// The node exists but is not the kind the caller asked for.
    #[error("node {node_id} is not a {expected}")]
    NodeKindMismatch { node_id: String, expected: NodeKind },

    /// The VM has no hypervisor after allocation.
    #[error("VM {0} is not assigned to a hypervisor")]
    NotAssigned(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The scheduler no longer accepts actions.
    #[error("scheduler is shut down")]
    SchedulerClosed,
}

impl ControllerError {
    /// Returns true if the error means a node does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_not_found(),
            Self::Provisioning(ProvisioningError::Registry(e)) => e.is_not_found(),
            _ => false,
        }
    }
}
