//! SQLite registry backend with document-store semantics.
//!
//! Each node is one JSON document carrying a revision number. Writes are
//! compare-and-swap on that revision, and the unique-key index lives in its
//! own table whose rows are claimed and released one at a time. Nothing spans
//! more than one row atomically, so several processes can share the database
//! the way several controllers share a document store:
//!
//! - `add_node` inserts a reservation row (no document yet), claims every key,
//!   then fills in the document. A failed claim releases what was claimed and
//!   drops the reservation.
//! - `set_node` claims new keys, writes the document, then releases the keys
//!   the node no longer holds.
//! - A write that loses a revision race re-reads and retries under the
//!   configured [`RetryPolicy`].
//!
//! A crash between those steps can leave orphaned claims or reservations;
//! [`Registry::cleanup_index`] repairs them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::record::check_caller_keys;
use crate::retry::{Attempt, RetryPolicy};
use crate::{
    name_key, Document, IndexRepair, NewNode, NodeDoc, NodeQuery, NodeRecord, NodeUpdate,
    Registry,
};

/// Reservations younger than this are assumed to belong to an `add_node`
/// still in progress.
pub const DEFAULT_RESERVATION_GRACE: Duration = Duration::from_secs(60);

/// Registry stored in SQLite.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
    reservation_grace: Duration,
}

impl SqliteRegistry {
    /// Open or create a registry database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> RegistryResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers in other processes proceed during a write.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> RegistryResult<Self> {
        let registry = Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
            reservation_grace: DEFAULT_RESERVATION_GRACE,
        };
        registry.init_schema()?;
        Ok(registry)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reservation_grace(mut self, grace: Duration) -> Self {
        self.reservation_grace = grace;
        self
    }

    fn init_schema(&self) -> RegistryResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                rev INTEGER NOT NULL,
                parent TEXT,
                doc TEXT,
                reserved_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent);

            CREATE TABLE IF NOT EXISTS unique_keys (
                key TEXT PRIMARY KEY,
                node_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_unique_keys_node ON unique_keys(node_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> RegistryResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// Read-modify-write one document under the retry policy.
    fn modify(
        &self,
        operation: &'static str,
        node_id: &str,
        f: impl Fn(&mut NodeRecord),
    ) -> RegistryResult<()> {
        let conn = self.conn()?;
        self.retry.run(operation, node_id, || {
            let (rev, mut record) = load_existing(&conn, node_id)?;
            f(&mut record);
            store(&conn, rev, &record)
        })
    }
}

fn load(conn: &Connection, node_id: &str) -> RegistryResult<Option<(i64, NodeRecord)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT rev, doc FROM nodes WHERE node_id = ?1 AND doc IS NOT NULL",
            params![node_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((rev, doc)) => Ok(Some((rev, serde_json::from_str(&doc)?))),
        None => Ok(None),
    }
}

fn load_existing(conn: &Connection, node_id: &str) -> RegistryResult<(i64, NodeRecord)> {
    load(conn, node_id)?.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
}

fn load_all(conn: &Connection) -> RegistryResult<Vec<NodeRecord>> {
    let mut stmt =
        conn.prepare("SELECT doc FROM nodes WHERE doc IS NOT NULL ORDER BY node_id")?;
    let docs = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(RegistryError::from))
        .collect()
}

/// Write `record` if the stored revision is still `rev`.
fn store(conn: &Connection, rev: i64, record: &NodeRecord) -> RegistryResult<Attempt<()>> {
    let doc = serde_json::to_string(record)?;
    let changed = conn.execute(
        "UPDATE nodes SET doc = ?1, parent = ?2, rev = rev + 1 WHERE node_id = ?3 AND rev = ?4",
        params![doc, record.parent, record.node_id, rev],
    )?;
    Ok(if changed == 1 {
        Attempt::Done(())
    } else {
        Attempt::Conflict
    })
}

fn key_owner(conn: &Connection, key: &str) -> RegistryResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT node_id FROM unique_keys WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Claim each key for `node_id`. On the first key held elsewhere, release the
/// keys claimed so far and fail.
fn claim_all<'a>(
    conn: &Connection,
    node_id: &str,
    keys: impl IntoIterator<Item = &'a String>,
) -> RegistryResult<()> {
    let mut claimed = Vec::new();
    for key in keys {
        let outcome = conn
            .execute(
                "INSERT OR IGNORE INTO unique_keys (key, node_id) VALUES (?1, ?2)",
                params![key, node_id],
            )
            .map_err(RegistryError::from)
            .and_then(|_| key_owner(conn, key));

        match outcome {
            Ok(Some(owner)) if owner == node_id => claimed.push(key),
            Ok(owner) => {
                release_all(conn, node_id, claimed)?;
                return Err(RegistryError::UniqueConstraintViolation {
                    key: key.clone(),
                    owner: owner.unwrap_or_default(),
                });
            }
            Err(e) => {
                release_all(conn, node_id, claimed)?;
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Release each key, but only where `node_id` still owns it.
fn release_all<'a>(
    conn: &Connection,
    node_id: &str,
    keys: impl IntoIterator<Item = &'a String>,
) -> RegistryResult<()> {
    for key in keys {
        conn.execute(
            "DELETE FROM unique_keys WHERE key = ?1 AND node_id = ?2",
            params![key, node_id],
        )?;
    }
    Ok(())
}

fn drop_reservation(conn: &Connection, node_id: &str) -> RegistryResult<()> {
    conn.execute(
        "DELETE FROM nodes WHERE node_id = ?1 AND doc IS NULL",
        params![node_id],
    )?;
    conn.execute("DELETE FROM unique_keys WHERE node_id = ?1", params![node_id])?;
    Ok(())
}

fn reserved_before(reserved_at: Option<&str>, cutoff: Option<DateTime<Utc>>) -> bool {
    let Some(cutoff) = cutoff else {
        return false;
    };
    match reserved_at.map(DateTime::parse_from_rfc3339) {
        Some(Ok(at)) => at.with_timezone(&Utc) < cutoff,
        // Unreadable timestamps never become fresh again.
        _ => true,
    }
}

impl Registry for SqliteRegistry {
    fn contains_node(&self, node_id: &str) -> RegistryResult<bool> {
        Ok(load(&*self.conn()?, node_id)?.is_some())
    }

    fn list_nodes(&self) -> RegistryResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT node_id FROM nodes WHERE doc IS NOT NULL ORDER BY node_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn get_node(&self, node_id: &str) -> RegistryResult<NodeDoc> {
        let (_, record) = load_existing(&*self.conn()?, node_id)?;
        Ok(NodeDoc::from_record(&record))
    }

    fn get_node_by_name(&self, name: &str) -> RegistryResult<NodeDoc> {
        self.get_node_by_key(&name_key(name))
            .map_err(|_| RegistryError::NodeNotFound(format!("name {name}")))
    }

    fn get_node_by_key(&self, key: &str) -> RegistryResult<NodeDoc> {
        let conn = self.conn()?;
        let record = match key_owner(&conn, key)? {
            Some(owner) => load(&conn, &owner)?.map(|(_, record)| record),
            None => None,
        };

        // A claim left behind by an interrupted write does not count.
        record
            .filter(|record| record.claimed_keys().contains(key))
            .map(|record| NodeDoc::from_record(&record))
            .ok_or_else(|| RegistryError::NodeNotFound(format!("key {key}")))
    }

    fn get_nodes(&self, query: &NodeQuery) -> RegistryResult<Vec<NodeDoc>> {
        Ok(load_all(&*self.conn()?)?
            .iter()
            .filter(|record| query.matches(record))
            .map(NodeDoc::from_record)
            .collect())
    }

    fn add_node(&self, node: NewNode) -> RegistryResult<()> {
        let conn = self.conn()?;
        let node_id = node.node_id.clone();

        let reserved = conn.execute(
            "INSERT OR IGNORE INTO nodes (node_id, rev, parent, doc, reserved_at)
             VALUES (?1, 0, NULL, NULL, ?2)",
            params![node_id, Utc::now().to_rfc3339()],
        )?;
        if reserved == 0 {
            return Err(RegistryError::NodeAlreadyExists(node_id));
        }

        let commit = || -> RegistryResult<()> {
            check_caller_keys(&node.unique_keys)?;
            let record = node.into_record();
            claim_all(&conn, &node_id, &record.claimed_keys())?;

            let doc = serde_json::to_string(&record)?;
            conn.execute(
                "UPDATE nodes SET doc = ?1, rev = 1, reserved_at = NULL
                 WHERE node_id = ?2 AND rev = 0",
                params![doc, node_id],
            )?;
            Ok(())
        };

        match commit() {
            Ok(()) => {
                debug!(node_id = %node_id, "Node added");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = drop_reservation(&conn, &node_id) {
                    warn!(
                        node_id = %node_id,
                        error = %cleanup,
                        "Failed to drop reservation, left for index cleanup"
                    );
                }
                Err(e)
            }
        }
    }

    fn set_node(&self, node_id: &str, update: NodeUpdate) -> RegistryResult<()> {
        if let Some(keys) = &update.unique_keys {
            check_caller_keys(keys)?;
        }

        let conn = self.conn()?;
        self.retry.run("set_node", node_id, || {
            let (rev, current) = load_existing(&conn, node_id)?;

            let mut next = current.clone();
            next.apply_fields(&update);
            if let Some(keys) = &update.unique_keys {
                next.unique_keys = keys.clone();
            }
            if let Some(name) = &update.name {
                next.name = name.clone();
            }

            let old_keys = current.claimed_keys();
            let new_keys = next.claimed_keys();
            let added: BTreeSet<String> = new_keys.difference(&old_keys).cloned().collect();

            claim_all(&conn, node_id, &added)?;
            match store(&conn, rev, &next)? {
                Attempt::Done(()) => {
                    release_all(&conn, node_id, old_keys.difference(&new_keys))?;
                    Ok(Attempt::Done(()))
                }
                Attempt::Conflict => {
                    release_all(&conn, node_id, &added)?;
                    Ok(Attempt::Conflict)
                }
            }
        })
    }

    fn set_parent(&self, node_id: &str, parent: Option<&str>) -> RegistryResult<()> {
        let conn = self.conn()?;
        self.retry.run("set_parent", node_id, || {
            let (rev, mut record) = load_existing(&conn, node_id)?;

            match parent {
                None if record.parent.is_none() => return Ok(Attempt::Done(())),
                None => record.parent = None,
                Some(parent) => {
                    if parent == node_id {
                        return Err(RegistryError::InvalidParent(node_id.to_string()));
                    }
                    if load(&conn, parent)?.is_none() {
                        return Err(RegistryError::NodeNotFound(parent.to_string()));
                    }
                    match &record.parent {
                        Some(existing) if existing == parent => return Ok(Attempt::Done(())),
                        Some(existing) => {
                            return Err(RegistryError::NodeAlreadyHasParent {
                                node_id: node_id.to_string(),
                                parent: existing.clone(),
                            })
                        }
                        None => record.parent = Some(parent.to_string()),
                    }
                }
            }

            store(&conn, rev, &record)
        })?;

        debug!(node_id = %node_id, parent = ?parent, "Parent set");
        Ok(())
    }

    fn update_metadata(
        &self,
        node_id: &str,
        extra: Document,
        delete_keys: &[String],
    ) -> RegistryResult<()> {
        self.modify("update_metadata", node_id, |record| {
            record.merge_metadata(&extra, delete_keys)
        })
    }

    fn set_blob(&self, node_id: &str, key: &str, value: Option<Value>) -> RegistryResult<()> {
        self.modify("set_blob", node_id, |record| {
            record.put_blob(key, value.clone())
        })
    }

    fn get_blob(&self, node_id: &str, key: &str) -> RegistryResult<Option<Value>> {
        let (_, record) = load_existing(&*self.conn()?, node_id)?;
        Ok(record.blobs.get(key).cloned())
    }

    fn delete_node(&self, node_id: &str) -> RegistryResult<()> {
        let conn = self.conn()?;
        self.retry.run("delete_node", node_id, || {
            let (rev, record) = load_existing(&conn, node_id)?;

            if let Some(parent) = &record.parent {
                return Err(RegistryError::NodeStillUsed {
                    node_id: node_id.to_string(),
                    reason: format!("still placed on {parent}"),
                });
            }
            let children: i64 = conn.query_row(
                "SELECT COUNT(*) FROM nodes WHERE parent = ?1 AND doc IS NOT NULL",
                params![node_id],
                |row| row.get(0),
            )?;
            if children > 0 {
                return Err(RegistryError::NodeStillUsed {
                    node_id: node_id.to_string(),
                    reason: format!("{children} node(s) still name it as parent"),
                });
            }

            let deleted = conn.execute(
                "DELETE FROM nodes WHERE node_id = ?1 AND rev = ?2",
                params![node_id, rev],
            )?;
            if deleted == 0 {
                return Ok(Attempt::Conflict);
            }
            release_all(&conn, node_id, &record.claimed_keys())?;
            Ok(Attempt::Done(()))
        })?;

        debug!(node_id = %node_id, "Node deleted");
        Ok(())
    }

    fn cleanup_index(&self) -> RegistryResult<IndexRepair> {
        let conn = self.conn()?;
        let mut repair = IndexRepair::default();

        let cutoff = chrono::Duration::from_std(self.reservation_grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace));

        let reservations: Vec<(String, Option<String>)> = {
            let mut stmt = conn.prepare("SELECT node_id, reserved_at FROM nodes WHERE doc IS NULL")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut in_flight = BTreeSet::new();
        for (node_id, reserved_at) in reservations {
            if reserved_before(reserved_at.as_deref(), cutoff) {
                drop_reservation(&conn, &node_id)?;
                repair.reservations_dropped.push(node_id);
            } else {
                in_flight.insert(node_id);
            }
        }

        let records: BTreeMap<String, NodeRecord> = load_all(&conn)?
            .into_iter()
            .map(|record| (record.node_id.clone(), record))
            .collect();

        let claims: Vec<(String, String)> = {
            let mut stmt = conn.prepare("SELECT key, node_id FROM unique_keys ORDER BY key")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (key, owner) in claims {
            if in_flight.contains(&owner) {
                continue;
            }
            let held = records
                .get(&owner)
                .is_some_and(|record| record.claimed_keys().contains(&key));
            if !held {
                release_all(&conn, &owner, [&key])?;
                repair.released.push(key);
            }
        }

        for record in records.values() {
            for key in record.claimed_keys() {
                match key_owner(&conn, &key)? {
                    Some(owner) if owner == record.node_id => {}
                    Some(owner) => repair
                        .conflicts
                        .push(format!("{key} held by {} and {owner}", record.node_id)),
                    None => {
                        conn.execute(
                            "INSERT OR IGNORE INTO unique_keys (key, node_id) VALUES (?1, ?2)",
                            params![key, record.node_id],
                        )?;
                        repair.reclaimed.push(key);
                    }
                }
            }
        }

        if !repair.is_clean() {
            info!(
                released = repair.released.len(),
                reclaimed = repair.reclaimed.len(),
                conflicts = repair.conflicts.len(),
                reservations_dropped = repair.reservations_dropped.len(),
                "Repaired unique-key index"
            );
        }
        Ok(repair)
    }
}
