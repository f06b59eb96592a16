//! In-Memory Node Store
//!
//! Process-local implementation of [`NodeStore`] with the same contract as
//! the SQL backend. Every operation runs under one table lock, so a call is
//! applied in full or not at all. `set_available(false)` makes every call
//! fail with `BackendUnavailable` without touching state.

use crate::domain::ports::{NodeAnnouncement, NodeLookup, NodeRecord, NodeStore};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
struct NodeTable {
    /// Rows by surrogate id
    rows: BTreeMap<i64, NodeRecord>,
    /// `node_id` -> surrogate id
    by_node_id: HashMap<String, i64>,
    /// Last id handed out, ids are never reused
    last_id: i64,
}

impl NodeTable {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// In-memory node store
#[derive(Debug)]
pub struct MemoryNodeStore {
    table: RwLock<NodeTable>,
    available: AtomicBool,
    /// Writes allowed before the backend starts failing (for testing)
    writes_before_failure: AtomicUsize,
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(NodeTable::default()),
            available: AtomicBool::new(true),
            writes_before_failure: AtomicUsize::new(usize::MAX),
        }
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Let `count` more writes succeed, then fail every later one (for testing)
    pub fn fail_writes_after(&self, count: usize) {
        self.writes_before_failure.store(count, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    /// Consume one write from the failure budget
    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        let budget = self.writes_before_failure.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |left| left.checked_sub(1),
        );
        budget.map(|_| ()).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> Error {
        Error::BackendUnavailable {
            backend: self.backend().to_string(),
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn find_all(&self) -> Result<Vec<NodeRecord>> {
        self.check_available()?;
        Ok(self.table.read().rows.values().cloned().collect())
    }

    fn find_by_node_id(&self, node_id: &str) -> Result<NodeLookup> {
        debug!(node_id, "Looking for node");
        self.check_available()?;

        let table = self.table.read();
        let record = table
            .by_node_id
            .get(node_id)
            .and_then(|id| table.rows.get(id))
            .cloned();
        Ok(record.into())
    }

    fn upsert_from_announcement(&self, announcement: &NodeAnnouncement) -> Result<NodeRecord> {
        announcement.validate()?;

        let mut table = self.table.write();
        self.check_writable()?;

        let now = Utc::now();
        let existing = table.by_node_id.get(&announcement.node_id).copied();
        let record = match existing.and_then(|id| table.rows.get_mut(&id)) {
            Some(record) => {
                debug!(node_id = %record.node_id, id = record.id, "Found existing node record");
                record.apply_announcement(announcement);
                record.updated_at = now;
                record.clone()
            }
            None => {
                debug!(node_id = %announcement.node_id, "Creating a new node record");
                let id = table.next_id();
                let record = NodeRecord::from_announcement(id, announcement, now);
                table.by_node_id.insert(record.node_id.clone(), id);
                table.rows.insert(id, record.clone());
                record
            }
        };

        Ok(record)
    }

    fn update(&self, record: &mut NodeRecord) -> Result<()> {
        let mut table = self.table.write();
        self.check_writable()?;

        let (previous_node_id, created_at) = match table.rows.get(&record.id) {
            Some(existing) => (existing.node_id.clone(), existing.created_at),
            None => {
                return Err(Error::NodeNotFound {
                    node_id: record.node_id.clone(),
                })
            }
        };
        if previous_node_id != record.node_id && table.by_node_id.contains_key(&record.node_id) {
            return Err(Error::DuplicateNodeId {
                node_id: record.node_id.clone(),
            });
        }

        // created_at is owned by the store
        let mut stored = record.clone();
        stored.created_at = created_at;
        stored.updated_at = Utc::now();

        table.by_node_id.remove(&previous_node_id);
        table.by_node_id.insert(stored.node_id.clone(), stored.id);
        record.updated_at = stored.updated_at;
        table.rows.insert(stored.id, stored);
        Ok(())
    }

    fn delete(&self, record: &NodeRecord) -> Result<()> {
        let mut table = self.table.write();
        self.check_writable()?;

        match table.rows.remove(&record.id) {
            Some(removed) => {
                table.by_node_id.remove(&removed.node_id);
                debug!(node_id = %removed.node_id, id = removed.id, "Deleted node record");
                Ok(())
            }
            None => Err(Error::NodeNotFound {
                node_id: record.node_id.clone(),
            }),
        }
    }

    fn purge_pending_delete(&self, record: &NodeRecord, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut table = self.table.write();
        self.check_writable()?;

        let purgeable = table
            .rows
            .get(&record.id)
            .is_some_and(|current| current.is_purgeable(cutoff));
        if !purgeable {
            return Ok(false);
        }

        if let Some(removed) = table.rows.remove(&record.id) {
            table.by_node_id.remove(&removed.node_id);
            debug!(node_id = %removed.node_id, id = removed.id, "Purged node record");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn announcement(node_id: &str, name: &str, online: bool) -> NodeAnnouncement {
        NodeAnnouncement {
            node_id: node_id.to_string(),
            name: name.to_string(),
            version: "0.4.0".into(),
            hostname: format!("{}.local", name),
            online,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_then_find() {
        let store = MemoryNodeStore::new();
        let created = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        assert_eq!(created.id, 1);

        let found = store.find_by_node_id("n1").unwrap().require("n1").unwrap();
        assert_eq!(found, created);
        assert!(found.online);
        assert!(store.find_by_node_id("unknown").unwrap().is_not_found());
    }

    #[test]
    fn test_upsert_overwrites_in_place() {
        let store = MemoryNodeStore::new();
        let first = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        let second = store
            .upsert_from_announcement(&announcement("n1", "renamed", false))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.name, "renamed");
        assert!(!second.online);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_and_rename() {
        let store = MemoryNodeStore::new();
        let mut n1 = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        store
            .upsert_from_announcement(&announcement("n2", "agent2", true))
            .unwrap();

        n1.node_id = "n2".into();
        assert_matches!(store.update(&mut n1), Err(Error::DuplicateNodeId { .. }));

        n1.node_id = "n1-renamed".into();
        n1.online = false;
        store.update(&mut n1).unwrap();
        assert!(store.find_by_node_id("n1").unwrap().is_not_found());
        let found = store
            .find_by_node_id("n1-renamed")
            .unwrap()
            .require("n1-renamed")
            .unwrap();
        assert_eq!(found.id, n1.id);
        assert!(!found.online);
    }

    #[test]
    fn test_delete_and_ids_not_reused() {
        let store = MemoryNodeStore::new();
        let n1 = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        store.delete(&n1).unwrap();
        assert!(store.is_empty());
        assert_matches!(store.delete(&n1), Err(Error::NodeNotFound { .. }));

        let again = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        assert!(again.id > n1.id);
    }

    #[test]
    fn test_purge_rechecks_current_row() {
        let store = MemoryNodeStore::new();
        let mut n1 = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        n1.online = false;
        n1.pending_delete = true;
        store.update(&mut n1).unwrap();
        let scanned = n1.clone();

        // Reconnects after the scan
        store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        assert!(!store.purge_pending_delete(&scanned, Utc::now()).unwrap());
        assert!(store.find_by_node_id("n1").unwrap().is_found());

        let mut n1 = store.find_by_node_id("n1").unwrap().require("n1").unwrap();
        n1.online = false;
        n1.pending_delete = true;
        store.update(&mut n1).unwrap();
        // Not old enough yet
        assert!(!store
            .purge_pending_delete(&n1, n1.updated_at - chrono::Duration::seconds(1))
            .unwrap());

        assert!(store.purge_pending_delete(&n1, Utc::now()).unwrap());
        assert!(store.is_empty());
        assert!(!store.purge_pending_delete(&n1, Utc::now()).unwrap());
    }

    #[test]
    fn test_unavailable_backend_leaves_state_untouched() {
        let store = MemoryNodeStore::new();
        let before = store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();

        store.set_available(false);
        assert_matches!(
            store.upsert_from_announcement(&announcement("n1", "changed", false)),
            Err(Error::BackendUnavailable { .. })
        );
        let mut changed = before.clone();
        changed.online = false;
        assert_matches!(store.update(&mut changed), Err(Error::BackendUnavailable { .. }));
        assert_matches!(store.find_all(), Err(Error::BackendUnavailable { .. }));

        store.set_available(true);
        let found = store.find_by_node_id("n1").unwrap().require("n1").unwrap();
        assert_eq!(found, before);
    }

    #[test]
    fn test_fail_writes_after() {
        let store = MemoryNodeStore::new();
        store.fail_writes_after(1);

        store
            .upsert_from_announcement(&announcement("n1", "agent1", true))
            .unwrap();
        assert_matches!(
            store.upsert_from_announcement(&announcement("n2", "agent2", true)),
            Err(Error::BackendUnavailable { .. })
        );
        assert_eq!(store.len(), 1);
        // Reads keep working
        assert!(store.find_by_node_id("n1").unwrap().is_found());
    }
}
