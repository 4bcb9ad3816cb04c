//! JSON file registry backend.
//!
//! The whole registry lives in one JSON document:
//!
//! ```text
//! { "version": 1, "nodes": { node_id: record, ... }, "unique": { key: node_id, ... } }
//! ```
//!
//! Every operation takes a `flock` on a sibling lock file (shared for reads,
//! exclusive for writes), loads the document, and for writes saves it back via
//! write-to-temp + rename. Several processes can share one registry file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::{
    Document, IndexRepair, NewNode, NodeDoc, NodeQuery, NodeUpdate, Registry, RegistryState,
};

/// Persisted document format version.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRegistry {
    version: u32,
    #[serde(flatten)]
    state: RegistryState,
}

/// An advisory lock on a file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let operation = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: as above; closing the file would also release the lock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Registry persisted to a JSON file.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    /// `flock` only excludes other open file descriptions; this orders threads.
    local: Mutex<()>,
}

impl FileRegistry {
    /// Open (or lazily create) the registry at `path`.
    ///
    /// The lock file defaults to `<path>.lock`.
    pub fn open(path: impl Into<PathBuf>, lock_path: Option<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        let lock_path = lock_path.unwrap_or_else(|| sibling(&path, ".lock"));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        debug!(path = %path.display(), lock_path = %lock_path.display(), "Opened file registry");
        Ok(Self {
            path,
            lock_path,
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> RegistryResult<RegistryState> {
        if !self.path.exists() {
            return Ok(RegistryState::default());
        }

        let content = fs::read_to_string(&self.path)?;
        let persisted: PersistedRegistry = serde_json::from_str(&content)?;
        if persisted.version != FORMAT_VERSION {
            return Err(RegistryError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "registry file {} has format version {}, expected {}",
                    self.path.display(),
                    persisted.version,
                    FORMAT_VERSION
                ),
            )));
        }
        Ok(persisted.state)
    }

    fn save(&self, state: RegistryState) -> RegistryResult<()> {
        let persisted = PersistedRegistry {
            version: FORMAT_VERSION,
            state,
        };
        let content = serde_json::to_vec_pretty(&persisted)?;

        let tmp_path = sibling(&self.path, ".tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&content)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            node_count = persisted.state.nodes.len(),
            "Saved registry"
        );
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryState) -> RegistryResult<T>) -> RegistryResult<T> {
        let _local = self.local.lock().map_err(|_| RegistryError::Poisoned)?;
        let _lock = FileLock::acquire(&self.lock_path, false)?;
        f(&self.load()?)
    }

    /// Load, mutate and save under an exclusive lock. Nothing is written if
    /// `f` fails.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let _local = self.local.lock().map_err(|_| RegistryError::Poisoned)?;
        let _lock = FileLock::acquire(&self.lock_path, true)?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.save(state)?;
        Ok(out)
    }
}

impl Registry for FileRegistry {
    fn contains_node(&self, node_id: &str) -> RegistryResult<bool> {
        self.read(|state| Ok(state.contains(node_id)))
    }

    fn list_nodes(&self) -> RegistryResult<Vec<String>> {
        self.read(|state| Ok(state.list_nodes()))
    }

    fn get_node(&self, node_id: &str) -> RegistryResult<NodeDoc> {
        self.read(|state| state.get_node(node_id))
    }

    fn get_node_by_name(&self, name: &str) -> RegistryResult<NodeDoc> {
        self.read(|state| state.get_node_by_name(name))
    }

    fn get_node_by_key(&self, key: &str) -> RegistryResult<NodeDoc> {
        self.read(|state| state.get_node_by_key(key))
    }

    fn get_nodes(&self, query: &NodeQuery) -> RegistryResult<Vec<NodeDoc>> {
        self.read(|state| Ok(state.get_nodes(query)))
    }

    fn add_node(&self, node: NewNode) -> RegistryResult<()> {
        self.write(|state| state.add_node(node))
    }

    fn set_node(&self, node_id: &str, update: NodeUpdate) -> RegistryResult<()> {
        self.write(|state| state.set_node(node_id, update))
    }

    fn set_parent(&self, node_id: &str, parent: Option<&str>) -> RegistryResult<()> {
        self.write(|state| state.set_parent(node_id, parent))
    }

    fn update_metadata(
        &self,
        node_id: &str,
        extra: Document,
        delete_keys: &[String],
    ) -> RegistryResult<()> {
        self.write(|state| state.update_metadata(node_id, &extra, delete_keys))
    }

    fn set_blob(&self, node_id: &str, key: &str, value: Option<Value>) -> RegistryResult<()> {
        self.write(|state| state.set_blob(node_id, key, value))
    }

    fn get_blob(&self, node_id: &str, key: &str) -> RegistryResult<Option<Value>> {
        self.read(|state| state.get_blob(node_id, key))
    }

    fn delete_node(&self, node_id: &str) -> RegistryResult<()> {
        self.write(|state| state.delete_node(node_id))
    }

    fn cleanup_index(&self) -> RegistryResult<IndexRepair> {
        self.write(|state| Ok(state.repair_index()))
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_never_aliases_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.tmp");
        assert_eq!(sibling(&path, ".tmp"), dir.path().join("registry.tmp.tmp"));

        let registry = FileRegistry::open(&path, None).unwrap();
        registry.add_node(NewNode::new("hv1", "hv1", "hv")).unwrap();
        registry.add_node(NewNode::new("hv2", "hv2", "hv")).unwrap();

        assert!(!dir.path().join("registry.tmp.tmp").exists());
        let reopened = FileRegistry::open(&path, None).unwrap();
        assert_eq!(reopened.list_nodes().unwrap().len(), 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = FileRegistry::open(&path, None).unwrap();
        registry
            .add_node(NewNode::new("hv1", "hv1.example.com", "hv").unique_keys(["ip-10.0.0.1"]))
            .unwrap();
        drop(registry);

        let reopened = FileRegistry::open(&path, None).unwrap();
        let node = reopened.get_node_by_key("ip-10.0.0.1").unwrap();
        assert_eq!(node.id(), "hv1");
        assert!(dir.path().join("registry.json.lock").exists());
    }

    #[test]
    fn test_failed_write_does_not_touch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = FileRegistry::open(&path, None).unwrap();
        registry.add_node(NewNode::new("hv1", "hv1", "hv")).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(registry.add_node(NewNode::new("hv1", "other", "hv")).is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_document_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = FileRegistry::open(&path, None).unwrap();
        registry.add_node(NewNode::new("hv1", "hv1", "hv")).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["nodes"]["hv1"]["name"], "hv1");
        assert_eq!(doc["unique"]["NAME_hv1"], "hv1");
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, r#"{"version": 99, "nodes": {}, "unique": {}}"#).unwrap();

        let registry = FileRegistry::open(&path, None).unwrap();
        assert!(matches!(registry.list_nodes(), Err(RegistryError::Io(_))));
    }
}
