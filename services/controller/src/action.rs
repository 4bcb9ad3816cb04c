//! Named lifecycle actions.
//!
//! An action is plain data so it can be queued; [`Manager::action`] runs it.
//!
//! Actions read and write the registry inline. Each touches one VM with a
//! handful of calls, and the background scheduler runs them on its own
//! worker task. The monitor, which walks every hypervisor, moves its
//! registry work onto the blocking pool instead.

use std::sync::Arc;

use tracing::{info, warn};

use crate::driver::VmOperation;
use crate::error::{ControllerError, ControllerResult};
use crate::manager::Manager;
use crate::monitor::Monitor;
use crate::node::{NodeView, VirtualMachine};
use crate::transaction;

/// Queue name for actions that touch no single VM.
pub const MONITOR_QUEUE: &str = "monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Place an unplaced VM and define it on its hypervisor.
    VmDefine { vm: String, hint: Option<String> },
    /// Like `VmDefine`, but the driver also provisions storage.
    VmProvision { vm: String, hint: Option<String> },
    VmStart { vm: String, hint: Option<String> },
    VmStop { vm: String },
    VmShutdown { vm: String },
    VmReboot { vm: String },
    VmUndefine { vm: String },
    VmDeprovision { vm: String },
    /// One monitor pass.
    Poll,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VmDefine { .. } => "vm_define",
            Self::VmProvision { .. } => "vm_provision",
            Self::VmStart { .. } => "vm_start",
            Self::VmStop { .. } => "vm_stop",
            Self::VmShutdown { .. } => "vm_shutdown",
            Self::VmReboot { .. } => "vm_reboot",
            Self::VmUndefine { .. } => "vm_undefine",
            Self::VmDeprovision { .. } => "vm_deprovision",
            Self::Poll => "poll",
        }
    }

    pub fn vm_id(&self) -> Option<&str> {
        match self {
            Self::VmDefine { vm, .. }
            | Self::VmProvision { vm, .. }
            | Self::VmStart { vm, .. }
            | Self::VmStop { vm }
            | Self::VmShutdown { vm }
            | Self::VmReboot { vm }
            | Self::VmUndefine { vm }
            | Self::VmDeprovision { vm } => Some(vm),
            Self::Poll => None,
        }
    }

    /// Actions on the same queue must not run concurrently.
    pub fn queue(&self) -> &str {
        self.vm_id().unwrap_or(MONITOR_QUEUE)
    }

    pub(crate) async fn execute(self, manager: &Arc<Manager>) -> ControllerResult<()> {
        info!(
            txid = %transaction::txid(),
            source = %transaction::source(),
            action = self.name(),
            vm = self.vm_id().unwrap_or("-"),
            "Executing action"
        );

        match self {
            Self::VmDefine { vm, hint } => {
                let mut vm = manager.get_virtual_machine(&vm)?;
                define(manager, &mut vm, hint.as_deref(), VmOperation::Define).await
            }
            Self::VmProvision { vm, hint } => {
                let mut vm = manager.get_virtual_machine(&vm)?;
                define(manager, &mut vm, hint.as_deref(), VmOperation::Provision).await
            }
            Self::VmStart { vm, hint } => {
                let mut vm = manager.get_virtual_machine(&vm)?;
                if vm.parent_id().is_none() {
                    define(manager, &mut vm, hint.as_deref(), VmOperation::Define).await?;
                }
                let hv = vm
                    .parent()?
                    .ok_or_else(|| ControllerError::NotAssigned(vm.id().to_string()))?;
                vm.set_state("starting")?;
                hv.call(VmOperation::Start, &vm).await
            }
            Self::VmStop { vm } => transition(manager, &vm, "stopping", VmOperation::Stop).await,
            Self::VmShutdown { vm } => {
                transition(manager, &vm, "shutting down", VmOperation::Shutdown).await
            }
            Self::VmReboot { vm } => {
                transition(manager, &vm, "rebooting", VmOperation::Reboot).await
            }
            Self::VmUndefine { vm } => call_if_placed(manager, &vm, VmOperation::Undefine).await,
            Self::VmDeprovision { vm } => {
                call_if_placed(manager, &vm, VmOperation::Deprovision).await
            }
            Self::Poll => {
                Monitor::new(Arc::clone(manager)).poll_nodes().await?;
                Ok(())
            }
        }
    }
}

/// Allocate an unplaced VM, mark it defined and run `operation` on its new
/// hypervisor. Already placed VMs are left alone.
async fn define(
    manager: &Arc<Manager>,
    vm: &mut VirtualMachine,
    hint: Option<&str>,
    operation: VmOperation,
) -> ControllerResult<()> {
    if let Some(parent) = vm.parent_id() {
        info!(vm_id = %vm.id(), hv_id = %parent, "VM already placed");
        return Ok(());
    }

    if let Some(hv_id) = manager.allocator().allocate(manager, vm, hint)? {
        info!(vm_id = %vm.id(), hv_id = %hv_id, "Allocated VM");
    }
    vm.refresh()?;

    let Some(hv) = vm.parent()? else {
        warn!(vm_id = %vm.id(), "No hypervisor available for VM");
        return Ok(());
    };
    vm.set_state("defined")?;
    hv.call(operation, vm).await
}

/// Record the transitional state and run `operation`, if the VM is placed.
async fn transition(
    manager: &Arc<Manager>,
    vm_id: &str,
    state: &str,
    operation: VmOperation,
) -> ControllerResult<()> {
    let mut vm = manager.get_virtual_machine(vm_id)?;
    let Some(hv) = vm.parent()? else {
        return Ok(());
    };
    vm.set_state(state)?;
    hv.call(operation, &vm).await
}

async fn call_if_placed(
    manager: &Arc<Manager>,
    vm_id: &str,
    operation: VmOperation,
) -> ControllerResult<()> {
    let vm = manager.get_virtual_machine(vm_id)?;
    match vm.parent()? {
        Some(hv) => hv.call(operation, &vm).await,
        None => Ok(()),
    }
}
