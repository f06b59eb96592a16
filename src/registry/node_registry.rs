//! Node Registry
//!
//! The handle the hosting server constructs once at startup and shares with
//! every connection handler. It wraps a [`NodeStore`], refuses announcements
//! until the startup reconciliation has run, keeps counters and broadcasts
//! lifecycle events.

use super::events::RegistryEvent;
use super::reconciler::{ConnectionReconciler, ReconcileReport};
use crate::config::ReconcilerConfig;
use crate::domain::ports::{NodeAnnouncement, NodeLookup, NodeRecord, NodeStore};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Statistics
// =============================================================================

/// Counters for registry activity since startup
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Announcements accepted
    pub announcements: AtomicU64,
    /// Announcements that created a new record
    pub registrations: AtomicU64,
    /// Nodes switched offline by a disconnect
    pub disconnects: AtomicU64,
    /// Nodes flagged for removal
    pub marked_for_deletion: AtomicU64,
    /// Records physically removed
    pub deletions: AtomicU64,
    /// Records corrected by reconciliation passes
    pub reconciled: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            announcements: self.announcements.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            marked_for_deletion: self.marked_for_deletion.load(Ordering::Relaxed),
            deletions: self.deletions.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatsSnapshot {
    pub announcements: u64,
    pub registrations: u64,
    pub disconnects: u64,
    pub marked_for_deletion: u64,
    pub deletions: u64,
    pub reconciled: u64,
}

// =============================================================================
// Node Registry
// =============================================================================

/// Shared handle over the node record store
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    reconciler: ConnectionReconciler,
    /// Set once a reconciliation pass completed
    reconciled: AtomicBool,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("backend", &self.store.backend())
            .field("reconciled", &self.is_reconciled())
            .finish()
    }
}

impl NodeRegistry {
    /// Create a new registry over `store`
    pub fn new(store: Arc<dyn NodeStore>, config: ReconcilerConfig) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            store,
            reconciler: ConnectionReconciler::new(config),
            reconciled: AtomicBool::new(false),
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Whether announcements are being accepted
    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::Acquire)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    /// Force every online record offline.
    ///
    /// Must complete before the server accepts node connections; until it
    /// succeeds, [`announce`](Self::announce) fails with `NotReconciled`.
    pub fn reconcile_online_status(&self) -> Result<ReconcileReport> {
        let result = self.reconciler.reconcile(self.store.as_ref());

        let corrected = match &result {
            Ok(report) => report.corrected,
            Err(Error::ReconcileIncomplete { corrected, .. }) => *corrected,
            Err(_) => 0,
        };
        if corrected > 0 {
            self.stats.reconciled.fetch_add(corrected as u64, Ordering::Relaxed);
        }

        let report = result?;
        self.reconciled.store(true, Ordering::Release);
        self.emit(RegistryEvent::OnlineStatusReconciled {
            corrected: report.corrected,
        });
        Ok(report)
    }

    /// Record a node announcement (connect or metadata refresh)
    pub fn announce(&self, announcement: &NodeAnnouncement) -> Result<NodeRecord> {
        if !self.is_reconciled() {
            return Err(Error::NotReconciled);
        }

        let record = self.store.upsert_from_announcement(announcement)?;
        self.stats.announcements.fetch_add(1, Ordering::Relaxed);

        // Insert sets both timestamps to the same instant, an update moves updated_at
        if record.created_at == record.updated_at {
            self.stats.registrations.fetch_add(1, Ordering::Relaxed);
            info!(node_id = %record.node_id, id = record.id, "Registered new node");
            self.emit(RegistryEvent::NodeRegistered {
                node_id: record.node_id.clone(),
                hostname: record.hostname.clone(),
                online: record.online,
            });
        } else {
            debug!(node_id = %record.node_id, online = record.online, "Updated node");
            self.emit(RegistryEvent::NodeUpdated {
                node_id: record.node_id.clone(),
                online: record.online,
            });
        }

        Ok(record)
    }

    /// Mark a node offline after its connection closed
    pub fn disconnect(&self, node_id: &str) -> Result<NodeRecord> {
        let mut record = self.store.find_by_node_id(node_id)?.require(node_id)?;
        record.online = false;
        self.store.update(&mut record)?;

        self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
        info!(node_id, "Node disconnected");
        self.emit(RegistryEvent::NodeWentOffline {
            node_id: record.node_id.clone(),
        });
        Ok(record)
    }

    /// Flag a node for removal; the record stays queryable until deleted
    pub fn mark_pending_delete(&self, node_id: &str) -> Result<NodeRecord> {
        let mut record = self.store.find_by_node_id(node_id)?.require(node_id)?;
        record.pending_delete = true;
        self.store.update(&mut record)?;

        self.stats.marked_for_deletion.fetch_add(1, Ordering::Relaxed);
        info!(node_id, "Node marked for deletion");
        self.emit(RegistryEvent::NodeMarkedForDeletion {
            node_id: record.node_id.clone(),
        });
        Ok(record)
    }

    /// Overwrite an already loaded record
    pub fn update(&self, record: &mut NodeRecord) -> Result<()> {
        self.store.update(record)?;
        self.emit(RegistryEvent::NodeUpdated {
            node_id: record.node_id.clone(),
            online: record.online,
        });
        Ok(())
    }

    /// Physically remove a record
    pub fn delete(&self, record: &NodeRecord) -> Result<()> {
        self.store.delete(record)?;

        self.stats.deletions.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %record.node_id, "Node deleted");
        self.emit(RegistryEvent::NodeDeleted {
            node_id: record.node_id.clone(),
        });
        Ok(())
    }

    /// Remove a record flagged for deletion if it is still offline and
    /// untouched since `cutoff`; a node that reconnected in the meantime is kept
    pub fn purge_pending_delete(&self, record: &NodeRecord, cutoff: DateTime<Utc>) -> Result<bool> {
        if !self.store.purge_pending_delete(record, cutoff)? {
            return Ok(false);
        }

        self.stats.deletions.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %record.node_id, "Node purged");
        self.emit(RegistryEvent::NodeDeleted {
            node_id: record.node_id.clone(),
        });
        Ok(true)
    }

    /// Look up a node by its stable identity
    pub fn find_by_node_id(&self, node_id: &str) -> Result<NodeLookup> {
        self.store.find_by_node_id(node_id)
    }

    /// All records regardless of state
    pub fn find_all(&self) -> Result<Vec<NodeRecord>> {
        self.store.find_all()
    }

    /// Ids of nodes currently recorded as online
    pub fn online_node_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .find_all()?
            .into_iter()
            .filter(|record| record.online)
            .map(|record| record.node_id)
            .collect())
    }

    /// Records flagged for removal
    pub fn pending_delete_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self
            .store
            .find_all()?
            .into_iter()
            .filter(|record| record.pending_delete)
            .collect())
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryNodeStore, SqliteNodeStore};
    use assert_matches::assert_matches;

    fn memory_registry() -> (Arc<NodeRegistry>, Arc<MemoryNodeStore>) {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = NodeRegistry::new(store.clone(), ReconcilerConfig::default());
        (registry, store)
    }

    #[test]
    fn test_announce_requires_reconciliation() {
        let (registry, store) = memory_registry();
        let announcement = NodeAnnouncement::online("n1", "agent1");

        assert_matches!(registry.announce(&announcement), Err(Error::NotReconciled));
        assert!(store.is_empty());

        registry.reconcile_online_status().unwrap();
        assert!(registry.is_reconciled());
        let record = registry.announce(&announcement).unwrap();
        assert!(record.online);
    }

    #[test]
    fn test_failed_reconciliation_keeps_gate_closed() {
        let (registry, store) = memory_registry();
        store.set_available(false);

        assert!(registry.reconcile_online_status().is_err());
        assert!(!registry.is_reconciled());

        store.set_available(true);
        registry.reconcile_online_status().unwrap();
        assert!(registry.is_reconciled());
    }

    #[test]
    fn test_restart_lifecycle_on_sqlite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nodes.db");
        let open = || -> Arc<NodeRegistry> {
            let store = SqliteNodeStore::open(&path, std::time::Duration::from_secs(5)).unwrap();
            NodeRegistry::new(Arc::new(store), ReconcilerConfig::default())
        };

        // First server run: two nodes connect, then the process dies
        {
            let registry = open();
            registry.reconcile_online_status().unwrap();
            registry.announce(&NodeAnnouncement::online("n1", "agent1")).unwrap();
            registry.announce(&NodeAnnouncement::online("n2", "agent2")).unwrap();
            assert_eq!(registry.online_node_ids().unwrap().len(), 2);
        }

        // Second run: the sweep clears stale state, then n1 reconnects
        let registry = open();
        let report = registry.reconcile_online_status().unwrap();
        assert_eq!(report.corrected, 2);
        assert!(registry.online_node_ids().unwrap().is_empty());

        registry.announce(&NodeAnnouncement::online("n1", "agent1")).unwrap();
        assert_eq!(registry.online_node_ids().unwrap(), vec!["n1".to_string()]);

        let stats = registry.stats();
        assert_eq!(stats.reconciled, 2);
        assert_eq!(stats.announcements, 1);
        assert_eq!(stats.registrations, 0);
    }

    #[test]
    fn test_disconnect_and_soft_delete() {
        let (registry, _store) = memory_registry();
        registry.reconcile_online_status().unwrap();
        registry.announce(&NodeAnnouncement::online("n1", "agent1")).unwrap();

        let record = registry.disconnect("n1").unwrap();
        assert!(!record.online);

        let record = registry.mark_pending_delete("n1").unwrap();
        assert!(record.pending_delete);
        // Still queryable until purged
        assert!(registry.find_by_node_id("n1").unwrap().is_found());
        assert_eq!(registry.pending_delete_nodes().unwrap().len(), 1);

        registry.delete(&record).unwrap();
        assert!(registry.find_by_node_id("n1").unwrap().is_not_found());

        assert_matches!(
            registry.disconnect("n1"),
            Err(Error::NodeNotFound { node_id }) if node_id == "n1"
        );

        let stats = registry.stats();
        assert_eq!(stats.registrations, 1);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.marked_for_deletion, 1);
        assert_eq!(stats.deletions, 1);
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let (registry, _store) = memory_registry();
        let mut events = registry.subscribe();

        registry.reconcile_online_status().unwrap();
        registry.announce(&NodeAnnouncement::online("n1", "agent1")).unwrap();
        registry.announce(&NodeAnnouncement::online("n1", "agent1")).unwrap();
        registry.disconnect("n1").unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::OnlineStatusReconciled { corrected: 0 }
        );
        assert_matches!(events.try_recv().unwrap(), RegistryEvent::NodeRegistered { .. });
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::NodeUpdated {
                node_id: "n1".into(),
                online: true,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::NodeWentOffline {
                node_id: "n1".into(),
            }
        );
        assert!(events.try_recv().is_err());
    }
}
