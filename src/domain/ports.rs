//! Domain Ports - Core types and the persistence port for the registry
//!
//! `NodeStore` is the boundary between the registry logic and the
//! persistence backend. Adapters in [`crate::registry`] implement it.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Node Record
// =============================================================================

/// One persisted row per known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Surrogate primary key, assigned by the store on creation
    pub id: i64,
    /// Stable identity reported by the node (its connection id)
    pub node_id: String,
    pub name: String,
    pub version: String,
    pub ip_address: String,
    pub hostname: String,
    pub os_name: String,
    /// Last explicit connection state recorded for the node
    pub online: bool,
    pub query_engine_enabled: bool,
    pub query_engine_version: Option<String>,
    pub query_engine_config_path: Option<String>,
    /// Soft-delete marker, purged by an explicit delete
    pub pending_delete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Overwrite every mutable field with the announcement's values.
    ///
    /// `id`, `node_id` and the timestamps are left alone.
    pub fn apply_announcement(&mut self, announcement: &NodeAnnouncement) {
        self.name = announcement.name.clone();
        self.version = announcement.version.clone();
        self.ip_address = announcement.ip_address.clone();
        self.hostname = announcement.hostname.clone();
        self.os_name = announcement.os_name.clone();
        self.online = announcement.online;
        self.query_engine_enabled = announcement.query_engine_enabled;
        self.query_engine_version = announcement.query_engine_version.clone();
        self.query_engine_config_path = announcement.query_engine_config_path.clone();
        self.pending_delete = announcement.pending_delete;
    }

    /// Build the record inserted on first sight of a node.
    ///
    /// New records never start out pending deletion.
    pub fn from_announcement(id: i64, announcement: &NodeAnnouncement, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            id,
            node_id: announcement.node_id.clone(),
            name: String::new(),
            version: String::new(),
            ip_address: String::new(),
            hostname: String::new(),
            os_name: String::new(),
            online: false,
            query_engine_enabled: false,
            query_engine_version: None,
            query_engine_config_path: None,
            pending_delete: false,
            created_at: now,
            updated_at: now,
        };
        record.apply_announcement(announcement);
        record.pending_delete = false;
        record
    }

    /// Flagged for removal, offline, and unchanged since `cutoff`
    pub fn is_purgeable(&self, cutoff: DateTime<Utc>) -> bool {
        self.pending_delete && !self.online && self.updated_at <= cutoff
    }
}

// =============================================================================
// Node Announcement
// =============================================================================

/// Metadata a node (or its connection handler) supplies on connect or update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAnnouncement {
    pub node_id: String,
    pub name: String,
    pub version: String,
    pub ip_address: String,
    pub hostname: String,
    pub os_name: String,
    pub online: bool,
    pub query_engine_enabled: bool,
    pub query_engine_version: Option<String>,
    pub query_engine_config_path: Option<String>,
    pub pending_delete: bool,
}

impl NodeAnnouncement {
    /// Create an announcement for a node that just connected
    pub fn online(node_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            online: true,
            ..Default::default()
        }
    }

    /// Reject announcements that can't be keyed
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidAnnouncement("node_id must not be empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Lookup Result
// =============================================================================

/// Outcome of a lookup by `node_id`
///
/// A miss is an expected outcome, kept apart from store failures which
/// surface through `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    Found(NodeRecord),
    NotFound,
}

impl NodeLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, NodeLookup::Found(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeLookup::NotFound)
    }

    pub fn into_option(self) -> Option<NodeRecord> {
        match self {
            NodeLookup::Found(record) => Some(record),
            NodeLookup::NotFound => None,
        }
    }

    /// Turn a miss into `Error::NodeNotFound`
    pub fn require(self, node_id: &str) -> Result<NodeRecord> {
        self.into_option().ok_or_else(|| Error::NodeNotFound {
            node_id: node_id.to_string(),
        })
    }
}

impl From<Option<NodeRecord>> for NodeLookup {
    fn from(record: Option<NodeRecord>) -> Self {
        match record {
            Some(record) => NodeLookup::Found(record),
            None => NodeLookup::NotFound,
        }
    }
}

// =============================================================================
// NodeStore Trait
// =============================================================================

/// Durable, transactional CRUD over node records
///
/// Every mutating call runs in its own transaction and is either fully
/// applied or fully rolled back before an error is returned. Calls may be
/// issued concurrently from several connection handlers.
pub trait NodeStore: Send + Sync {
    /// Backend name, used in logs and errors
    fn backend(&self) -> &'static str;

    /// Every record regardless of `online` / `pending_delete`
    fn find_all(&self) -> Result<Vec<NodeRecord>>;

    /// Exact-match lookup by the node's stable identity
    fn find_by_node_id(&self, node_id: &str) -> Result<NodeLookup>;

    /// Create the record on first sight, otherwise overwrite every mutable
    /// field. Last writer wins.
    fn upsert_from_announcement(&self, announcement: &NodeAnnouncement) -> Result<NodeRecord>;

    /// Full-column overwrite by surrogate id. Refreshes `updated_at` on success.
    fn update(&self, record: &mut NodeRecord) -> Result<()>;

    /// Physical removal by surrogate id
    fn delete(&self, record: &NodeRecord) -> Result<()>;

    /// Remove the row with `record.id` only if, as currently stored, it is
    /// still [purgeable](NodeRecord::is_purgeable) at `cutoff`. The check and
    /// the delete share one transaction.
    ///
    /// Returns `false` when the row is gone or no longer qualifies.
    fn purge_pending_delete(&self, record: &NodeRecord, cutoff: DateTime<Utc>) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_from_announcement_never_pending_delete() {
        let mut announcement = NodeAnnouncement::online("n1", "agent1");
        announcement.pending_delete = true;
        announcement.query_engine_enabled = true;
        announcement.query_engine_version = Some("5.2.1".into());

        let now = Utc::now();
        let record = NodeRecord::from_announcement(7, &announcement, now);

        assert_eq!(record.id, 7);
        assert_eq!(record.node_id, "n1");
        assert_eq!(record.name, "agent1");
        assert!(record.online);
        assert!(!record.pending_delete);
        assert!(record.query_engine_enabled);
        assert_eq!(record.query_engine_version.as_deref(), Some("5.2.1"));
        assert_eq!(record.created_at, now);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn test_apply_announcement_overwrites_everything() {
        let now = Utc::now();
        let mut record = NodeRecord::from_announcement(
            1,
            &NodeAnnouncement {
                node_id: "n1".into(),
                name: "old".into(),
                hostname: "old.local".into(),
                query_engine_version: Some("1.0".into()),
                online: true,
                ..Default::default()
            },
            now,
        );

        let update = NodeAnnouncement {
            node_id: "n1".into(),
            name: "new".into(),
            pending_delete: true,
            ..Default::default()
        };
        record.apply_announcement(&update);

        assert_eq!(record.name, "new");
        // No merge: empty values replace old ones
        assert_eq!(record.hostname, "");
        assert_eq!(record.query_engine_version, None);
        assert!(!record.online);
        assert!(record.pending_delete);
        assert_eq!(record.id, 1);
    }

    #[test]
    fn test_is_purgeable() {
        let now = Utc::now();
        let mut record = NodeRecord::from_announcement(1, &NodeAnnouncement::online("n1", "a"), now);
        assert!(!record.is_purgeable(now));

        record.online = false;
        assert!(!record.is_purgeable(now));

        record.pending_delete = true;
        assert!(record.is_purgeable(now));
        // Touched after the cutoff
        assert!(!record.is_purgeable(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_announcement_validation() {
        assert!(NodeAnnouncement::online("n1", "a").validate().is_ok());
        assert_matches!(
            NodeAnnouncement::online("  ", "a").validate(),
            Err(Error::InvalidAnnouncement(_))
        );
    }

    #[test]
    fn test_announcement_json_defaults() {
        let announcement: NodeAnnouncement =
            serde_json::from_str(r#"{"node_id": "n1", "online": true}"#).unwrap();
        assert_eq!(announcement.node_id, "n1");
        assert!(announcement.online);
        assert!(!announcement.query_engine_enabled);
        assert_eq!(announcement.query_engine_config_path, None);
    }

    #[test]
    fn test_lookup_require() {
        assert_matches!(
            NodeLookup::NotFound.require("unknown"),
            Err(Error::NodeNotFound { node_id }) if node_id == "unknown"
        );
        assert!(NodeLookup::from(None).is_not_found());
    }
}
