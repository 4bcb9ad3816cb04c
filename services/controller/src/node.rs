//! Typed views over registry nodes.
//!
//! A [`NodeDoc`] is a plain snapshot. The views here pair it with the
//! [`Manager`] so a hypervisor can reach its driver and a VM can queue
//! lifecycle actions. Which view wraps a node is decided by its type through
//! the `[node_types]` table.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vagoth_reconcile::StatusRecord;
use vagoth_registry::{Document, NodeDoc, NodeQuery, TagFilter, Tags, STATE_KEY};

use crate::action::Action;
use crate::driver::{self, Driver, VmOperation};
use crate::error::{ControllerError, ControllerResult};
use crate::manager::Manager;

/// Driver used by hypervisors whose definition names none.
pub const DEFAULT_DRIVER: &str = "default";

/// Definition key naming a hypervisor's driver.
pub const DRIVER_KEY: &str = "driver";

/// The domain view a node type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Hypervisor,
    VirtualMachine,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hypervisor => f.write_str("hypervisor"),
            Self::VirtualMachine => f.write_str("virtual machine"),
        }
    }
}

/// Read accessors shared by every node view.
pub trait NodeView {
    fn doc(&self) -> &NodeDoc;

    fn id(&self) -> &str {
        self.doc().id()
    }

    fn name(&self) -> &str {
        self.doc().name()
    }

    fn node_type(&self) -> &str {
        self.doc().node_type()
    }

    fn tenant(&self) -> Option<&str> {
        self.doc().tenant()
    }

    fn definition(&self) -> &Document {
        self.doc().definition()
    }

    fn metadata(&self) -> &Document {
        self.doc().metadata()
    }

    fn tags(&self) -> &Tags {
        self.doc().tags()
    }

    fn unique_keys(&self) -> &BTreeSet<String> {
        self.doc().unique_keys()
    }

    fn parent_id(&self) -> Option<&str> {
        self.doc().parent()
    }

    /// Lifecycle state from the `state` metadata key.
    fn state(&self) -> &str {
        self.doc().state()
    }

    fn matches_tags(&self, required: &TagFilter) -> bool {
        self.doc().matches_tags(required)
    }
}

/// Write `state` into a node's metadata and reload the snapshot.
fn store_state(manager: &Manager, doc: &mut NodeDoc, state: &str) -> ControllerResult<()> {
    let mut extra = Document::new();
    extra.insert(STATE_KEY.to_string(), Value::String(state.to_string()));
    manager.registry().update_metadata(doc.id(), extra, &[])?;
    doc.refresh(manager.registry().as_ref())?;
    Ok(())
}

/// A node that hosts virtual machines.
#[derive(Clone)]
pub struct Hypervisor {
    manager: Arc<Manager>,
    doc: NodeDoc,
}

impl Hypervisor {
    pub(crate) fn new(manager: Arc<Manager>, doc: NodeDoc) -> Self {
        Self { manager, doc }
    }

    /// Name of the configured driver this hypervisor is managed by.
    pub fn driver_name(&self) -> &str {
        self.doc
            .definition()
            .get(DRIVER_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_DRIVER)
    }

    pub fn driver(&self) -> ControllerResult<Arc<dyn Driver>> {
        let name = self.driver_name();
        self.manager
            .driver(name)
            .ok_or_else(|| ControllerError::UnknownDriver(name.to_string()))
    }

    /// VMs currently placed here.
    pub fn children(&self) -> ControllerResult<Vec<VirtualMachine>> {
        let docs = self
            .manager
            .registry()
            .get_nodes(&NodeQuery::all().parent(self.doc.id()))?;

        let mut children = Vec::with_capacity(docs.len());
        for doc in docs {
            if let Node::VirtualMachine(vm) = self.manager.wrap(doc)? {
                children.push(vm);
            }
        }
        Ok(children)
    }

    pub fn set_state(&mut self, state: &str) -> ControllerResult<()> {
        store_state(&self.manager, &mut self.doc, state)
    }

    pub fn refresh(&mut self) -> ControllerResult<()> {
        self.doc.refresh(self.manager.registry().as_ref())?;
        Ok(())
    }

    /// Ask the driver what is running here, bounded by the driver timeout.
    pub async fn status(&self) -> ControllerResult<Vec<StatusRecord>> {
        let driver = self.driver()?;
        let report = driver::with_timeout(
            self.manager.driver_timeout(),
            self.doc.id(),
            "status",
            driver.status(&self.doc),
        )
        .await?;
        Ok(report)
    }

    pub async fn info(&self, vm: &VirtualMachine) -> ControllerResult<Document> {
        let driver = self.driver()?;
        let info = driver::with_timeout(
            self.manager.driver_timeout(),
            self.doc.id(),
            "info",
            driver.info(&self.doc, &vm.doc),
        )
        .await?;
        Ok(info)
    }

    /// Run one lifecycle operation for `vm` on this hypervisor.
    pub async fn call(&self, operation: VmOperation, vm: &VirtualMachine) -> ControllerResult<()> {
        let driver = self.driver()?;
        driver::with_timeout(
            self.manager.driver_timeout(),
            self.doc.id(),
            operation.as_str(),
            driver::dispatch(driver.as_ref(), operation, &self.doc, &vm.doc),
        )
        .await?;
        Ok(())
    }
}

impl NodeView for Hypervisor {
    fn doc(&self) -> &NodeDoc {
        &self.doc
    }
}

impl fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hypervisor").field("doc", &self.doc).finish()
    }
}

/// A guest placed on at most one hypervisor.
///
/// The lifecycle methods queue an [`Action`] on the configured scheduler;
/// whether they complete before returning depends on the scheduler.
#[derive(Clone)]
pub struct VirtualMachine {
    manager: Arc<Manager>,
    doc: NodeDoc,
}

impl VirtualMachine {
    pub(crate) fn new(manager: Arc<Manager>, doc: NodeDoc) -> Self {
        Self { manager, doc }
    }

    /// The hypervisor this VM is placed on, if any.
    pub fn parent(&self) -> ControllerResult<Option<Hypervisor>> {
        match self.doc.parent() {
            Some(parent) => Ok(Some(self.manager.get_hypervisor(parent)?)),
            None => Ok(None),
        }
    }

    pub fn set_state(&mut self, state: &str) -> ControllerResult<()> {
        store_state(&self.manager, &mut self.doc, state)
    }

    pub fn refresh(&mut self) -> ControllerResult<()> {
        self.doc.refresh(self.manager.registry().as_ref())?;
        Ok(())
    }

    pub async fn define(&self, hint: Option<&str>) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmDefine {
                vm: self.doc.id().to_string(),
                hint: hint.map(str::to_string),
            })
            .await
    }

    pub async fn provision(&self, hint: Option<&str>) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmProvision {
                vm: self.doc.id().to_string(),
                hint: hint.map(str::to_string),
            })
            .await
    }

    /// Start the VM, defining it first if it is not placed.
    pub async fn start(&self, hint: Option<&str>) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmStart {
                vm: self.doc.id().to_string(),
                hint: hint.map(str::to_string),
            })
            .await
    }

    pub async fn stop(&self) -> ControllerResult<()> {
        self.manager.schedule(Action::VmStop { vm: self.doc.id().to_string() }).await
    }

    pub async fn shutdown(&self) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmShutdown { vm: self.doc.id().to_string() })
            .await
    }

    pub async fn reboot(&self) -> ControllerResult<()> {
        self.manager.schedule(Action::VmReboot { vm: self.doc.id().to_string() }).await
    }

    pub async fn undefine(&self) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmUndefine { vm: self.doc.id().to_string() })
            .await
    }

    pub async fn deprovision(&self) -> ControllerResult<()> {
        self.manager
            .schedule(Action::VmDeprovision { vm: self.doc.id().to_string() })
            .await
    }
}

impl NodeView for VirtualMachine {
    fn doc(&self) -> &NodeDoc {
        &self.doc
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine").field("doc", &self.doc).finish()
    }
}

/// Any node, wrapped in the view its type maps to.
#[derive(Debug, Clone)]
pub enum Node {
    Hypervisor(Hypervisor),
    VirtualMachine(VirtualMachine),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Hypervisor(_) => NodeKind::Hypervisor,
            Self::VirtualMachine(_) => NodeKind::VirtualMachine,
        }
    }

    pub fn into_hypervisor(self) -> Option<Hypervisor> {
        match self {
            Self::Hypervisor(hv) => Some(hv),
            Self::VirtualMachine(_) => None,
        }
    }

    pub fn into_virtual_machine(self) -> Option<VirtualMachine> {
        match self {
            Self::VirtualMachine(vm) => Some(vm),
            Self::Hypervisor(_) => None,
        }
    }
}

impl NodeView for Node {
    fn doc(&self) -> &NodeDoc {
        match self {
            Self::Hypervisor(hv) => hv.doc(),
            Self::VirtualMachine(vm) => vm.doc(),
        }
    }
}
