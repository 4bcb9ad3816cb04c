//! Behaviour every registry backend must share.

use rstest::rstest;
use serde_json::{json, Value};
use tempfile::TempDir;

use vagoth_registry::{
    Document, FileRegistry, MemoryRegistry, NewNode, NodeQuery, NodeUpdate, Registry,
    RegistryError, SqliteRegistry, TagValue, Tags,
};

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    File,
    Sqlite,
}

struct Fixture {
    registry: Box<dyn Registry>,
    _dir: TempDir,
}

impl std::ops::Deref for Fixture {
    type Target = dyn Registry;

    fn deref(&self) -> &Self::Target {
        self.registry.as_ref()
    }
}

fn open(backend: Backend) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry: Box<dyn Registry> = match backend {
        Backend::Memory => Box::new(MemoryRegistry::new()),
        Backend::File => Box::new(FileRegistry::open(dir.path().join("registry.json"), None).unwrap()),
        Backend::Sqlite => Box::new(SqliteRegistry::open(dir.path().join("registry.db")).unwrap()),
    };
    Fixture {
        registry,
        _dir: dir,
    }
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn node001() -> NewNode {
    let mut tags = Tags::new();
    tags.insert("tag1".into(), TagValue::Flag(true));
    tags.insert("tag2".into(), TagValue::from("somevalue"));

    NewNode::new("0xdeadbeef", "node001.example.com", "hv")
        .tenant("mytenant")
        .definition(doc(json!({"cpus": 8, "ram_mb": 32768})))
        .metadata(doc(json!({"rack": "a1"})))
        .tags(tags)
        .unique_keys(["node001_uniquekey"])
}

#[rstest]
fn add_then_get_returns_supplied_fields(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();

    let node = registry.get_node("0xdeadbeef").unwrap();
    assert_eq!(node.name(), "node001.example.com");
    assert_eq!(node.node_type(), "hv");
    assert_eq!(node.tenant(), Some("mytenant"));
    assert_eq!(node.definition(), &doc(json!({"cpus": 8, "ram_mb": 32768})));
    assert_eq!(node.metadata(), &doc(json!({"rack": "a1"})));
    assert!(node.unique_keys().contains("node001_uniquekey"));
    assert_eq!(node.parent(), None);

    assert!(registry.contains_node("0xdeadbeef").unwrap());
    assert_eq!(registry.list_nodes().unwrap(), vec!["0xdeadbeef".to_string()]);
    assert_eq!(registry.get_node_by_name("node001.example.com").unwrap().id(), "0xdeadbeef");
    assert_eq!(registry.get_node_by_key("node001_uniquekey").unwrap().id(), "0xdeadbeef");
}

#[rstest]
fn lookups_of_missing_nodes_fail(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    assert!(registry.get_node("nope").unwrap_err().is_not_found());
    assert!(registry.get_node_by_name("nope").unwrap_err().is_not_found());
    assert!(registry.get_node_by_key("nope").unwrap_err().is_not_found());
    assert!(!registry.contains_node("nope").unwrap());
    assert!(registry.set_parent("nope", None).unwrap_err().is_not_found());
}

#[rstest]
fn duplicate_id_is_rejected_and_first_kept(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();

    let err = registry
        .add_node(NewNode::new("0xdeadbeef", "other.example.com", "vm"))
        .unwrap_err();

    assert!(matches!(err, RegistryError::NodeAlreadyExists(ref id) if id == "0xdeadbeef"));
    let node = registry.get_node("0xdeadbeef").unwrap();
    assert_eq!(node.name(), "node001.example.com");
    assert_eq!(node.node_type(), "hv");
    assert!(registry.get_node_by_name("other.example.com").is_err());
}

#[rstest]
fn duplicate_name_or_key_is_rejected_without_partial_node(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
    #[values("name", "key")] clash: &str,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();

    let second = match clash {
        "name" => NewNode::new("0xfeedface", "node001.example.com", "hv").unique_keys(["fresh"]),
        _ => NewNode::new("0xfeedface", "node002.example.com", "hv")
            .unique_keys(["fresh", "node001_uniquekey"]),
    };
    let err = registry.add_node(second).unwrap_err();

    assert!(matches!(err, RegistryError::UniqueConstraintViolation { ref owner, .. } if owner == "0xdeadbeef"));
    assert!(!registry.contains_node("0xfeedface").unwrap());
    assert!(registry.get_node_by_key("fresh").is_err());
    assert!(registry.get_node_by_name("node002.example.com").is_err());
    assert_eq!(registry.get_node_by_key("node001_uniquekey").unwrap().id(), "0xdeadbeef");

    // Nothing was left claimed: the same keys are free for a clean retry.
    registry
        .add_node(NewNode::new("0xfeedface", "node002.example.com", "hv").unique_keys(["fresh"]))
        .unwrap();
    assert!(registry.cleanup_index().unwrap().is_clean());
}

#[rstest]
fn reserved_name_prefix_is_rejected(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    let err = registry
        .add_node(NewNode::new("n1", "n1", "vm").unique_keys(["NAME_sneaky"]))
        .unwrap_err();
    assert!(matches!(err, RegistryError::ReservedKey(_)));
    assert!(!registry.contains_node("n1").unwrap());
}

#[rstest]
fn parent_must_be_cleared_before_reassigning(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    for (id, kind) in [("hv1", "hv"), ("hv2", "hv"), ("vm1", "vm")] {
        registry.add_node(NewNode::new(id, id, kind)).unwrap();
    }

    registry.set_parent("vm1", Some("hv1")).unwrap();
    registry.set_parent("vm1", Some("hv1")).unwrap();

    let err = registry.set_parent("vm1", Some("hv2")).unwrap_err();
    assert!(matches!(err, RegistryError::NodeAlreadyHasParent { ref parent, .. } if parent == "hv1"));
    assert_eq!(registry.get_node("vm1").unwrap().parent(), Some("hv1"));

    registry.set_parent("vm1", None).unwrap();
    registry.set_parent("vm1", Some("hv2")).unwrap();
    assert_eq!(registry.get_node("vm1").unwrap().parent(), Some("hv2"));
}

#[rstest]
fn parent_must_exist_and_differ(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(NewNode::new("vm1", "vm1", "vm")).unwrap();

    let err = registry.set_parent("vm1", Some("hv9")).unwrap_err();
    assert!(matches!(err, RegistryError::NodeNotFound(ref id) if id == "hv9"));

    let err = registry.set_parent("vm1", Some("vm1")).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidParent(_)));
    assert_eq!(registry.get_node("vm1").unwrap().parent(), None);
}

#[rstest]
fn delete_is_guarded_by_placement(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();
    registry
        .add_node(NewNode::new("vm1", "vm1.example.com", "vm").unique_keys(["mac-01"]))
        .unwrap();
    registry.set_parent("vm1", Some("0xdeadbeef")).unwrap();

    assert!(matches!(
        registry.delete_node("0xdeadbeef"),
        Err(RegistryError::NodeStillUsed { .. })
    ));
    assert!(matches!(
        registry.delete_node("vm1"),
        Err(RegistryError::NodeStillUsed { .. })
    ));

    registry.set_parent("vm1", None).unwrap();
    registry.delete_node("0xdeadbeef").unwrap();
    registry.delete_node("vm1").unwrap();

    assert!(registry.list_nodes().unwrap().is_empty());
    // Released keys can be claimed again.
    registry
        .add_node(NewNode::new("vm2", "vm1.example.com", "vm").unique_keys(["mac-01"]))
        .unwrap();
}

#[rstest]
fn metadata_updates_merge(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(NewNode::new("vm1", "vm1", "vm")).unwrap();

    registry.update_metadata("vm1", doc(json!({"k": "v"})), &[]).unwrap();
    registry.update_metadata("vm1", doc(json!({"other": 1})), &[]).unwrap();
    assert_eq!(
        registry.get_node("vm1").unwrap().metadata(),
        &doc(json!({"k": "v", "other": 1}))
    );

    registry
        .update_metadata("vm1", Document::new(), &["k".to_string()])
        .unwrap();
    assert_eq!(registry.get_node("vm1").unwrap().metadata(), &doc(json!({"other": 1})));
}

#[rstest]
fn metadata_update_deletes_then_merges(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry
        .add_node(NewNode::new("vm1", "vm1", "vm").metadata(doc(json!({
            "state": "running",
            "owner": "ops",
            "stale": true
        }))))
        .unwrap();

    registry
        .update_metadata(
            "vm1",
            doc(json!({"state": "stopped", "host": "hv1"})),
            &["stale".to_string(), "state".to_string(), "absent".to_string()],
        )
        .unwrap();

    // A key both deleted and supplied keeps the supplied value.
    assert_eq!(
        registry.get_node("vm1").unwrap().metadata(),
        &doc(json!({"state": "stopped", "owner": "ops", "host": "hv1"}))
    );
}

#[rstest]
fn set_node_changes_only_supplied_fields(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();

    let mut tags = Tags::new();
    tags.insert("a".into(), TagValue::from("b"));
    registry
        .set_node("0xdeadbeef", NodeUpdate::new().tags(tags.clone()))
        .unwrap();
    registry
        .set_node("0xdeadbeef", NodeUpdate::new().tenant("othertenant"))
        .unwrap();

    let node = registry.get_node("0xdeadbeef").unwrap();
    assert_eq!(node.tags(), &tags);
    assert_eq!(node.tenant(), Some("othertenant"));
    assert_eq!(node.name(), "node001.example.com");
    assert_eq!(node.definition(), &doc(json!({"cpus": 8, "ram_mb": 32768})));
    assert!(node.unique_keys().contains("node001_uniquekey"));
}

#[rstest]
fn rename_and_rekey(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();
    registry
        .add_node(NewNode::new("vm1", "vm1.example.com", "vm").unique_keys(["mac-01"]))
        .unwrap();

    // Taken name: the old name stays.
    let err = registry
        .set_node("0xdeadbeef", NodeUpdate::new().name("vm1.example.com"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::UniqueConstraintViolation { .. }));
    assert_eq!(registry.get_node_by_name("node001.example.com").unwrap().id(), "0xdeadbeef");

    registry
        .set_node(
            "0xdeadbeef",
            NodeUpdate::new()
                .name("renamed.example.com")
                .unique_keys(["ip-10.0.0.1"]),
        )
        .unwrap();

    assert_eq!(registry.get_node_by_name("renamed.example.com").unwrap().id(), "0xdeadbeef");
    assert!(registry.get_node_by_name("node001.example.com").is_err());
    assert_eq!(registry.get_node_by_key("ip-10.0.0.1").unwrap().id(), "0xdeadbeef");
    assert!(registry.get_node_by_key("node001_uniquekey").is_err());

    // The released key is free for someone else.
    registry
        .set_node("vm1", NodeUpdate::new().unique_keys(["mac-01", "node001_uniquekey"]))
        .unwrap();
    assert_eq!(registry.get_node_by_key("node001_uniquekey").unwrap().id(), "vm1");
    assert!(registry.cleanup_index().unwrap().is_clean());
}

#[rstest]
fn blobs_are_stored_per_key(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(NewNode::new("vm1", "vm1", "vm")).unwrap();

    registry
        .set_blob("vm1", "console", Some(json!("boot ok")))
        .unwrap();
    assert_eq!(registry.get_blob("vm1", "console").unwrap(), Some(json!("boot ok")));
    assert_eq!(registry.get_blob("vm1", "other").unwrap(), None);

    let node = registry.get_node("vm1").unwrap();
    assert_eq!(node.get_blob(&*registry, "console").unwrap(), Some(json!("boot ok")));

    registry.set_blob("vm1", "console", None).unwrap();
    assert_eq!(registry.get_blob("vm1", "console").unwrap(), None);
}

#[rstest]
fn query_filters_combine(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(node001()).unwrap();
    registry
        .add_node(NewNode::new("vm1", "vm1", "vm").tenant("mytenant"))
        .unwrap();
    registry.add_node(NewNode::new("vm2", "vm2", "vm")).unwrap();
    registry.set_parent("vm1", Some("0xdeadbeef")).unwrap();

    let ids = |query: NodeQuery| -> Vec<String> {
        let mut ids: Vec<String> = registry
            .get_nodes(&query)
            .unwrap()
            .iter()
            .map(|node| node.id().to_string())
            .collect();
        ids.sort();
        ids
    };

    assert_eq!(ids(NodeQuery::all()).len(), 3);
    assert_eq!(ids(NodeQuery::all().node_type("vm")), vec!["vm1", "vm2"]);
    assert_eq!(ids(NodeQuery::all().tenant("mytenant").node_type("vm")), vec!["vm1"]);
    assert_eq!(ids(NodeQuery::all().without_tenant()), vec!["vm2"]);
    assert_eq!(ids(NodeQuery::all().parent("0xdeadbeef")), vec!["vm1"]);
    assert_eq!(ids(NodeQuery::all().unparented().node_type("vm")), vec!["vm2"]);
    assert_eq!(ids(NodeQuery::all().tag("tag1", None)), vec!["0xdeadbeef"]);
    assert_eq!(
        ids(NodeQuery::all().tag("tag2", Some(TagValue::from("somevalue")))),
        vec!["0xdeadbeef"]
    );
    assert!(ids(NodeQuery::all().tag("tag2", Some(TagValue::from("wrong")))).is_empty());
    assert!(ids(NodeQuery::all().tag("tag1", None).tag("tag3", None)).is_empty());
}

#[rstest]
fn snapshots_refresh_explicitly(
    #[values(Backend::Memory, Backend::File, Backend::Sqlite)] backend: Backend,
) {
    let registry = open(backend);
    registry.add_node(NewNode::new("vm1", "vm1", "vm")).unwrap();

    let mut node = registry.get_node("vm1").unwrap();
    assert_eq!(node.state(), "unknown");

    registry
        .update_metadata("vm1", doc(json!({"state": "running"})), &[])
        .unwrap();
    assert_eq!(node.state(), "unknown");

    node.refresh(&*registry).unwrap();
    assert_eq!(node.state(), "running");
}
