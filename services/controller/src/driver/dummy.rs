//! A driver that manages nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use vagoth_reconcile::StatusRecord;
use vagoth_registry::{Document, NodeDoc};

use super::{Driver, DriverSettings};
use crate::config::ConfigError;
use crate::error::{DriverError, DriverResult};

/// Placeholder driver for hypervisors that are tracked but not managed.
///
/// Lifecycle calls fail with [`DriverError::Unsupported`]. `status` reports
/// no VMs, so a poll unassigns anything placed on the hypervisor.
#[derive(Debug, Default)]
pub struct DummyDriver;

impl DummyDriver {
    pub fn new() -> Self {
        Self
    }

    pub fn from_settings(_settings: &DriverSettings) -> Result<Arc<dyn Driver>, ConfigError> {
        Ok(Arc::new(Self::new()))
    }

    fn unsupported(&self, operation: &'static str, vm: &NodeDoc) -> DriverResult<()> {
        debug!(vm_id = %vm.id(), operation, "Dummy driver ignoring call");
        Err(DriverError::Unsupported {
            driver: self.kind(),
            operation,
        })
    }
}

#[async_trait]
impl Driver for DummyDriver {
    fn kind(&self) -> &'static str {
        "dummy"
    }

    async fn provision(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("provision", vm)
    }

    async fn define(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("define", vm)
    }

    async fn undefine(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("undefine", vm)
    }

    async fn deprovision(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("deprovision", vm)
    }

    async fn start(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("start", vm)
    }

    async fn stop(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("stop", vm)
    }

    async fn shutdown(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("shutdown", vm)
    }

    async fn reboot(&self, _hv: &NodeDoc, vm: &NodeDoc) -> DriverResult<()> {
        self.unsupported("reboot", vm)
    }

    async fn info(&self, _hv: &NodeDoc, _vm: &NodeDoc) -> DriverResult<Document> {
        Ok(Document::new())
    }

    async fn status(&self, _hv: &NodeDoc) -> DriverResult<Vec<StatusRecord>> {
        Ok(Vec::new())
    }
}
