//! Monitor reconciliation against the mock driver.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;
use vagoth_controller::config::MonitorConfig;
use vagoth_controller::monitor::POLLED_AT_KEY;
use vagoth_controller::{Manager, MockDriver, Monitor, NodeView};
use vagoth_registry::{
    Document, FileRegistry, MemoryRegistry, NewNode, NodeQuery, Registry, SqliteRegistry,
};

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    File,
    Sqlite,
}

struct Cluster {
    _dir: TempDir,
    registry: Arc<dyn Registry>,
    driver: Arc<MockDriver>,
    manager: Arc<Manager>,
}

impl Cluster {
    fn new(backend: Backend, create_missing: bool) -> Self {
        Self::with_timeout(backend, create_missing, Duration::from_secs(5))
    }

    fn with_timeout(backend: Backend, create_missing: bool, driver_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<dyn Registry> = match backend {
            Backend::Memory => Arc::new(MemoryRegistry::new()),
            Backend::File => Arc::new(FileRegistry::open(dir.path().join("registry.json"), None).unwrap()),
            Backend::Sqlite => Arc::new(SqliteRegistry::open(dir.path().join("registry.db")).unwrap()),
        };
        let driver = Arc::new(MockDriver::new());
        let manager = Manager::builder(Arc::clone(&registry))
            .driver("default", driver.clone())
            .monitor(MonitorConfig {
                create_missing,
                ..MonitorConfig::default()
            })
            .driver_timeout(driver_timeout)
            .build();

        Self {
            _dir: dir,
            registry,
            driver,
            manager,
        }
    }

    fn add_hypervisor(&self, id: &str) {
        self.registry.add_node(NewNode::new(id, id, "hv")).unwrap();
    }

    fn add_vm(&self, id: &str, parent: Option<&str>, state: &str) {
        let metadata = Document::from_iter([("state".to_string(), json!(state))]);
        self.registry
            .add_node(NewNode::new(id, id, "vm").metadata(metadata))
            .unwrap();
        if parent.is_some() {
            self.registry.set_parent(id, parent).unwrap();
        }
    }

    fn monitor(&self) -> Monitor {
        Monitor::new(Arc::clone(&self.manager))
    }
}

#[rstest]
#[tokio::test]
async fn test_create_missing_registers_reported_vm(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let cluster = Cluster::new(backend, true);
    cluster.add_hypervisor("hv1");
    cluster.driver.place_vm("hv1", "vm1", "running");

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.vms_created, 1);

    let vm = cluster.registry.get_node("vm1").unwrap();
    assert_eq!(vm.node_type(), "vm");
    assert_eq!(vm.parent(), Some("hv1"));
    assert_eq!(vm.state(), "running");
}

#[rstest]
#[tokio::test]
async fn test_vanished_vm_is_unassigned(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let cluster = Cluster::new(backend, false);
    cluster.add_hypervisor("hv1");
    cluster.add_vm("vm1", Some("hv1"), "running");

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.vms_unassigned, 1);

    let vm = cluster.registry.get_node("vm1").unwrap();
    assert_eq!(vm.parent(), None);
    assert_eq!(vm.state(), "unassigned");

    // Unplaced now, so the hypervisor can be removed.
    cluster.registry.delete_node("hv1").unwrap();
}

#[rstest]
#[tokio::test]
async fn test_unreported_child_of_any_type_is_unassigned(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let cluster = Cluster::new(backend, false);
    cluster.add_hypervisor("hv1");
    cluster
        .registry
        .add_node(NewNode::new("disk1", "disk1", "volume"))
        .unwrap();
    cluster.registry.set_parent("disk1", Some("hv1")).unwrap();

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.vms_unassigned, 1);
    assert_eq!(stats.step_errors, 0);

    let disk = cluster.registry.get_node("disk1").unwrap();
    assert_eq!(disk.parent(), None);
    assert_eq!(disk.state(), "unassigned");
}

#[tokio::test]
async fn test_unreachable_hypervisor_is_isolated() {
    let cluster = Cluster::new(Backend::Memory, true);
    for hv in ["hv1", "hv2", "hv3"] {
        cluster.add_hypervisor(hv);
    }
    cluster.add_vm("vm2", Some("hv2"), "running");
    cluster.driver.place_vm("hv1", "vm1", "running");
    cluster.driver.place_vm("hv3", "vm3", "stopped");
    cluster.driver.set_unreachable("hv2", true);

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.hypervisors_polled, 3);
    assert_eq!(stats.hypervisors_failed, 1);
    assert_eq!(stats.vms_created, 2);

    assert_eq!(cluster.registry.get_node("vm1").unwrap().parent(), Some("hv1"));
    assert_eq!(cluster.registry.get_node("vm3").unwrap().state(), "stopped");

    // Placement on the failed hypervisor is left as it was.
    let vm2 = cluster.registry.get_node("vm2").unwrap();
    assert_eq!(vm2.parent(), Some("hv2"));
    assert_eq!(vm2.state(), "running");
}

#[tokio::test]
async fn test_slow_hypervisor_times_out() {
    let cluster = Cluster::with_timeout(Backend::Memory, true, Duration::from_millis(50));
    cluster.add_hypervisor("hv1");
    cluster.add_vm("vm1", Some("hv1"), "running");
    cluster.driver.set_latency(Duration::from_millis(500));

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.hypervisors_failed, 1);
    assert_eq!(cluster.registry.get_node("vm1").unwrap().parent(), Some("hv1"));
}

#[tokio::test]
async fn test_unplaced_vm_is_auto_assigned() {
    let cluster = Cluster::new(Backend::Memory, false);
    cluster.add_hypervisor("hv1");
    cluster.add_vm("vm1", None, "stopped");
    cluster.driver.place_vm("hv1", "vm1", "running");

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.vms_assigned, 1);
    assert_eq!(stats.states_updated, 1);

    let vm = cluster.manager.get_virtual_machine("vm1").unwrap();
    assert_eq!(vm.parent_id(), Some("hv1"));
    assert_eq!(vm.state(), "running");

    // A second pass has nothing left to do.
    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert!(stats.is_quiet());
}

#[tokio::test]
async fn test_unknown_vm_skipped_without_create_missing() {
    let cluster = Cluster::new(Backend::Memory, false);
    cluster.add_hypervisor("hv1");
    cluster.driver.place_vm("hv1", "vm1", "running");

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.vms_created, 0);
    assert_eq!(stats.skipped, 1);
    assert!(!cluster.registry.contains_node("vm1").unwrap());
}

#[tokio::test]
async fn test_vm_placed_elsewhere_is_left_alone() {
    let cluster = Cluster::new(Backend::Memory, false);
    cluster.add_hypervisor("hv1");
    cluster.add_hypervisor("hv2");
    cluster.add_vm("vm1", Some("hv2"), "running");
    cluster.driver.place_vm("hv1", "vm1", "migrating");
    cluster.driver.place_vm("hv2", "vm1", "running");

    let stats = cluster.monitor().poll_nodes().await.unwrap();
    assert_eq!(stats.conflicts, 1);

    let vm = cluster.registry.get_node("vm1").unwrap();
    assert_eq!(vm.parent(), Some("hv2"));
    assert_eq!(vm.state(), "running");
}

#[tokio::test]
async fn test_hypervisor_snapshot_is_merged() {
    let cluster = Cluster::new(Backend::Memory, false);
    cluster.add_hypervisor("hv1");
    cluster
        .registry
        .update_metadata(
            "hv1",
            Document::from_iter([("owner".to_string(), json!("ops"))]),
            &[],
        )
        .unwrap();
    cluster.driver.set_metrics(
        "hv1",
        Document::from_iter([
            ("load".to_string(), json!(0.25)),
            ("free_ram_mb".to_string(), json!(4096)),
        ]),
    );

    cluster.monitor().poll_nodes().await.unwrap();

    let hv = cluster.registry.get_node("hv1").unwrap();
    assert_eq!(hv.metadata()["load"], json!(0.25));
    assert_eq!(hv.metadata()["free_ram_mb"], json!(4096));
    assert_eq!(hv.metadata()["owner"], json!("ops"));
    assert!(hv.metadata().contains_key(POLLED_AT_KEY));

    // The snapshot is not mistaken for a VM.
    let vms = cluster
        .registry
        .get_nodes(&NodeQuery::all().node_type("vm"))
        .unwrap();
    assert!(vms.is_empty());
}
