//! Node creation and removal.
//!
//! A provisioner sits in front of the registry when nodes enter or leave the
//! cluster. Deployments plug in their own to enrich definitions (addresses,
//! storage, DNS); the default one passes requests through.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use vagoth_registry::{NewNode, Registry, RegistryError};

use crate::error::ProvisioningError;

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Register a node. On error the node is not registered.
    async fn provision(&self, node: NewNode) -> Result<(), ProvisioningError>;

    /// Clean up and remove a node. On error the node stays registered.
    async fn deprovision(&self, node_id: &str) -> Result<(), ProvisioningError>;
}

/// Registers nodes exactly as requested.
pub struct DefaultProvisioner {
    registry: Arc<dyn Registry>,
}

impl DefaultProvisioner {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Provisioner for DefaultProvisioner {
    async fn provision(&self, mut node: NewNode) -> Result<(), ProvisioningError> {
        if node.node_id.is_empty() || node.node_type.is_empty() {
            return Err(ProvisioningError::Rejected {
                node_id: node.node_id,
                reason: "node id and type are required".to_string(),
            });
        }
        if node.name.is_empty() {
            node.name = node.node_id.clone();
        }

        let node_id = node.node_id.clone();
        let registry = Arc::clone(&self.registry);
        blocking(move || registry.add_node(node)).await?;
        info!(node_id = %node_id, "Provisioned node");
        Ok(())
    }

    async fn deprovision(&self, node_id: &str) -> Result<(), ProvisioningError> {
        let registry = Arc::clone(&self.registry);
        let id = node_id.to_string();
        blocking(move || registry.delete_node(&id)).await?;
        info!(node_id = %node_id, "Deprovisioned node");
        Ok(())
    }
}

async fn blocking<F>(f: F) -> Result<(), RegistryError>
where
    F: FnOnce() -> Result<(), RegistryError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
}
