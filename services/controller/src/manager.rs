//! The composition root.
//!
//! A [`Manager`] is built once at startup and shared as `Arc<Manager>`. It
//! owns the registry handle and every pluggable collaborator, and turns
//! registry snapshots into typed node views.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;
use vagoth_registry::{NodeDoc, NodeQuery, Registry};

use crate::action::Action;
use crate::allocator::{Allocator, StaticAllocator};
use crate::config::{default_node_types, Config, ConfigError, MonitorConfig};
use crate::driver::{Driver, DriverTable, Drivers};
use crate::error::{ControllerError, ControllerResult};
use crate::node::{Hypervisor, Node, NodeKind, VirtualMachine};
use crate::provisioner::{DefaultProvisioner, Provisioner};
use crate::scheduler::{self, Scheduler, SyncScheduler};
use crate::transaction::{self, Transaction};

pub struct Manager {
    registry: Arc<dyn Registry>,
    provisioner: Arc<dyn Provisioner>,
    scheduler: Arc<dyn Scheduler>,
    allocator: Arc<dyn Allocator>,
    drivers: Drivers,
    node_types: BTreeMap<String, NodeKind>,
    monitor: MonitorConfig,
    driver_timeout: Duration,
}

/// Assembles a [`Manager`]; unset collaborators get their defaults.
pub struct ManagerBuilder {
    registry: Arc<dyn Registry>,
    provisioner: Option<Arc<dyn Provisioner>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    allocator: Option<Arc<dyn Allocator>>,
    drivers: Drivers,
    node_types: BTreeMap<String, NodeKind>,
    monitor: MonitorConfig,
    driver_timeout: Option<Duration>,
}

impl ManagerBuilder {
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn driver(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(name, driver);
        self
    }

    pub fn drivers(mut self, drivers: Drivers) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn node_types(mut self, node_types: BTreeMap<String, NodeKind>) -> Self {
        self.node_types = node_types;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Overrides `monitor.driver_timeout_secs` with a finer bound.
    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Arc<Manager> {
        let registry = self.registry;
        Arc::new(Manager {
            provisioner: self
                .provisioner
                .unwrap_or_else(|| Arc::new(DefaultProvisioner::new(Arc::clone(&registry)))),
            scheduler: self.scheduler.unwrap_or_else(|| Arc::new(SyncScheduler)),
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(StaticAllocator::new(None))),
            drivers: self.drivers,
            node_types: self.node_types,
            driver_timeout: self
                .driver_timeout
                .unwrap_or_else(|| self.monitor.driver_timeout()),
            monitor: self.monitor,
            registry,
        })
    }
}

impl Manager {
    pub fn builder(registry: Arc<dyn Registry>) -> ManagerBuilder {
        ManagerBuilder {
            registry,
            provisioner: None,
            scheduler: None,
            allocator: None,
            drivers: Drivers::default(),
            node_types: default_node_types(),
            monitor: MonitorConfig::default(),
            driver_timeout: None,
        }
    }

    /// Wire a manager from configuration. Must be called inside a tokio
    /// runtime when the background scheduler is configured.
    pub fn from_config(
        config: &Config,
        registry: Arc<dyn Registry>,
        table: &DriverTable,
    ) -> Result<Arc<Self>, ConfigError> {
        let drivers = table.build_all(&config.drivers)?;
        Ok(Self::builder(registry)
            .scheduler(scheduler::build(config.scheduler.kind))
            .allocator(Arc::new(StaticAllocator::new(config.allocator.node.clone())))
            .drivers(drivers)
            .node_types(config.node_types.clone())
            .monitor(config.monitor.clone())
            .build())
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn monitor_config(&self) -> &MonitorConfig {
        &self.monitor
    }

    pub fn driver_timeout(&self) -> Duration {
        self.driver_timeout
    }

    pub fn driver(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name)
    }

    /// The view a node type maps to.
    pub fn kind_of(&self, doc: &NodeDoc) -> ControllerResult<NodeKind> {
        self.node_types
            .get(doc.node_type())
            .copied()
            .ok_or_else(|| ControllerError::UnknownNodeType {
                node_id: doc.id().to_string(),
                node_type: doc.node_type().to_string(),
            })
    }

    /// Node types that map to `kind`.
    pub fn node_types_for(&self, kind: NodeKind) -> impl Iterator<Item = &str> {
        self.node_types
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(node_type, _)| node_type.as_str())
    }

    /// The node type to register new nodes of `kind` under. Prefers the
    /// conventional `hv`/`vm` names when they are mapped.
    pub fn node_type_for(&self, kind: NodeKind) -> Option<&str> {
        let conventional = match kind {
            NodeKind::Hypervisor => vagoth_reconcile::HYPERVISOR_RECORD_TYPE,
            NodeKind::VirtualMachine => vagoth_reconcile::VM_RECORD_TYPE,
        };
        if self.node_types.get(conventional) == Some(&kind) {
            return Some(conventional);
        }
        self.node_types_for(kind).next()
    }

    pub(crate) fn wrap(self: &Arc<Self>, doc: NodeDoc) -> ControllerResult<Node> {
        Ok(match self.kind_of(&doc)? {
            NodeKind::Hypervisor => Node::Hypervisor(Hypervisor::new(Arc::clone(self), doc)),
            NodeKind::VirtualMachine => {
                Node::VirtualMachine(VirtualMachine::new(Arc::clone(self), doc))
            }
        })
    }

    pub fn get_node(self: &Arc<Self>, node_id: &str) -> ControllerResult<Node> {
        let doc = self.registry.get_node(node_id)?;
        self.wrap(doc)
    }

    pub fn get_node_by_name(self: &Arc<Self>, name: &str) -> ControllerResult<Node> {
        let doc = self.registry.get_node_by_name(name)?;
        self.wrap(doc)
    }

    pub fn get_node_by_key(self: &Arc<Self>, key: &str) -> ControllerResult<Node> {
        let doc = self.registry.get_node_by_key(key)?;
        self.wrap(doc)
    }

    /// Nodes matching `query`. Nodes of unmapped types are left out.
    pub fn get_nodes(self: &Arc<Self>, query: &NodeQuery) -> ControllerResult<Vec<Node>> {
        let docs = self.registry.get_nodes(query)?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| self.wrap(doc).ok())
            .collect())
    }

    pub fn get_hypervisor(self: &Arc<Self>, node_id: &str) -> ControllerResult<Hypervisor> {
        self.get_node(node_id)?
            .into_hypervisor()
            .ok_or_else(|| ControllerError::NodeKindMismatch {
                node_id: node_id.to_string(),
                expected: NodeKind::Hypervisor,
            })
    }

    pub fn get_virtual_machine(self: &Arc<Self>, node_id: &str) -> ControllerResult<VirtualMachine> {
        self.get_node(node_id)?
            .into_virtual_machine()
            .ok_or_else(|| ControllerError::NodeKindMismatch {
                node_id: node_id.to_string(),
                expected: NodeKind::VirtualMachine,
            })
    }

    /// Every hypervisor, across all node types mapped to that kind.
    pub fn hypervisors(self: &Arc<Self>) -> ControllerResult<Vec<Hypervisor>> {
        let mut hypervisors = Vec::new();
        for node_type in self.node_types_for(NodeKind::Hypervisor) {
            for doc in self.registry.get_nodes(&NodeQuery::all().node_type(node_type))? {
                hypervisors.push(Hypervisor::new(Arc::clone(self), doc));
            }
        }
        Ok(hypervisors)
    }

    pub fn list_nodes(&self) -> ControllerResult<Vec<String>> {
        Ok(self.registry.list_nodes()?)
    }

    /// Execute an action now, in the current task.
    ///
    /// Runs inside a transaction (joining the caller's, if any). Failures
    /// are logged with the transaction context and returned.
    pub async fn action(self: &Arc<Self>, action: Action) -> ControllerResult<()> {
        let name = action.name();
        Transaction::new(name)
            .run(async move {
                let result = action.execute(self).await;
                if let Err(e) = &result {
                    error!(
                        txid = %transaction::txid(),
                        source = %transaction::source(),
                        action = name,
                        error = %e,
                        "Action failed"
                    );
                }
                result
            })
            .await
    }

    /// Hand an action to the configured scheduler.
    pub async fn schedule(self: &Arc<Self>, action: Action) -> ControllerResult<()> {
        self.scheduler.schedule(self, action).await
    }

    /// Drain the scheduler.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("drivers", &self.drivers)
            .field("node_types", &self.node_types)
            .field("driver_timeout", &self.driver_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use vagoth_registry::{MemoryRegistry, NewNode};

    use super::*;
    use crate::node::NodeView;

    fn registry() -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_node(NewNode::new("hv1", "hv1", "hv")).unwrap();
        registry.add_node(NewNode::new("box1", "box1", "box")).unwrap();
        registry
            .add_node(NewNode::new("vm1", "vm1", "vm").unique_keys(["10.0.0.5"]))
            .unwrap();
        registry
    }

    #[test]
    fn test_lookup_by_kind() {
        let manager = Manager::builder(registry()).build();

        assert_eq!(manager.get_hypervisor("hv1").unwrap().id(), "hv1");
        assert_eq!(manager.get_node_by_key("10.0.0.5").unwrap().id(), "vm1");
        assert!(matches!(
            manager.get_hypervisor("vm1"),
            Err(ControllerError::NodeKindMismatch { expected: NodeKind::Hypervisor, .. })
        ));
        assert!(manager.get_virtual_machine("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_unmapped_type() {
        let manager = Manager::builder(registry()).build();

        assert!(matches!(
            manager.get_node("box1"),
            Err(ControllerError::UnknownNodeType { ref node_type, .. }) if node_type == "box"
        ));
        assert_eq!(manager.get_nodes(&NodeQuery::all()).unwrap().len(), 2);
        assert_eq!(manager.list_nodes().unwrap().len(), 3);
    }

    #[test]
    fn test_extra_hypervisor_types() {
        let mut node_types = default_node_types();
        node_types.insert("box".to_string(), NodeKind::Hypervisor);
        let manager = Manager::builder(registry()).node_types(node_types).build();

        let mut ids: Vec<String> = manager
            .hypervisors()
            .unwrap()
            .iter()
            .map(|hv| hv.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["box1", "hv1"]);
        assert_eq!(manager.node_type_for(NodeKind::Hypervisor), Some("hv"));
    }

    #[test]
    fn test_node_type_for_custom_names() {
        let node_types = BTreeMap::from([
            ("host".to_string(), NodeKind::Hypervisor),
            ("guest".to_string(), NodeKind::VirtualMachine),
        ]);
        let manager = Manager::builder(registry()).node_types(node_types).build();

        assert_eq!(manager.node_type_for(NodeKind::VirtualMachine), Some("guest"));
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml(
            r#"
            [monitor]
            driver_timeout_secs = 7

            [drivers.default]
            kind = "mock"
            "#,
        )
        .unwrap();
        let manager = Manager::from_config(&config, registry(), &DriverTable::default()).unwrap();

        assert_eq!(manager.driver_timeout(), Duration::from_secs(7));
        assert_eq!(manager.driver("default").unwrap().kind(), "mock");
    }
}
