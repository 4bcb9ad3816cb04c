//! VM placement.

use tracing::debug;

use crate::error::{ControllerError, ControllerResult};
use crate::manager::Manager;
use crate::node::{NodeKind, NodeView, VirtualMachine};

/// Chooses a hypervisor for an unplaced VM.
pub trait Allocator: Send + Sync {
    /// Place `vm`, returning the hypervisor chosen. `None` means no
    /// placement was made.
    fn allocate(
        &self,
        manager: &Manager,
        vm: &VirtualMachine,
        hint: Option<&str>,
    ) -> ControllerResult<Option<String>>;
}

/// Places VMs on the hinted hypervisor, or else on one fixed hypervisor.
#[derive(Debug, Clone, Default)]
pub struct StaticAllocator {
    node: Option<String>,
}

impl StaticAllocator {
    pub fn new(node: Option<String>) -> Self {
        Self { node }
    }
}

impl Allocator for StaticAllocator {
    fn allocate(
        &self,
        manager: &Manager,
        vm: &VirtualMachine,
        hint: Option<&str>,
    ) -> ControllerResult<Option<String>> {
        let Some(target) = hint.or(self.node.as_deref()) else {
            debug!(vm_id = %vm.id(), "No hint and no default node configured");
            return Ok(None);
        };

        let doc = manager.registry().get_node(target)?;
        if manager.kind_of(&doc)? != NodeKind::Hypervisor {
            return Err(ControllerError::Allocation(format!(
                "{target} is not a hypervisor"
            )));
        }

        manager.registry().set_parent(vm.id(), Some(target))?;
        Ok(Some(target.to_string()))
    }
}
