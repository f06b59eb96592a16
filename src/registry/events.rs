//! Registry Events
//!
//! Events emitted by the node registry for external consumers to react to
//! node lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A previously unknown node announced itself
    NodeRegistered {
        node_id: String,
        hostname: String,
        online: bool,
    },

    /// A known node re-announced or had its record updated
    NodeUpdated { node_id: String, online: bool },

    /// A node's connection was closed
    NodeWentOffline { node_id: String },

    /// A node was flagged for removal
    NodeMarkedForDeletion { node_id: String },

    /// A node's record was physically removed
    NodeDeleted { node_id: String },

    /// The startup sweep forced stale online records offline
    OnlineStatusReconciled { corrected: usize },
}

impl RegistryEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::NodeRegistered { node_id, .. } => Some(node_id),
            RegistryEvent::NodeUpdated { node_id, .. } => Some(node_id),
            RegistryEvent::NodeWentOffline { node_id } => Some(node_id),
            RegistryEvent::NodeMarkedForDeletion { node_id } => Some(node_id),
            RegistryEvent::NodeDeleted { node_id } => Some(node_id),
            RegistryEvent::OnlineStatusReconciled { .. } => None,
        }
    }

    /// Check if this event concerns a single node
    pub fn is_node_event(&self) -> bool {
        self.node_id().is_some()
    }
}

impl std::fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEvent::NodeRegistered { node_id, hostname, .. } => {
                write!(f, "node_registered {} ({})", node_id, hostname)
            }
            RegistryEvent::NodeUpdated { node_id, online } => {
                write!(f, "node_updated {} online={}", node_id, online)
            }
            RegistryEvent::NodeWentOffline { node_id } => write!(f, "node_offline {}", node_id),
            RegistryEvent::NodeMarkedForDeletion { node_id } => {
                write!(f, "node_pending_delete {}", node_id)
            }
            RegistryEvent::NodeDeleted { node_id } => write!(f, "node_deleted {}", node_id),
            RegistryEvent::OnlineStatusReconciled { corrected } => {
                write!(f, "online_status_reconciled corrected={}", corrected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = RegistryEvent::NodeRegistered {
            node_id: "node-001".to_string(),
            hostname: "host.local".to_string(),
            online: true,
        };
        assert_eq!(event.node_id(), Some("node-001"));
        assert!(event.is_node_event());
        assert_eq!(event.to_string(), "node_registered node-001 (host.local)");
    }

    #[test]
    fn test_reconcile_event_has_no_node() {
        let event = RegistryEvent::OnlineStatusReconciled { corrected: 3 };
        assert_eq!(event.node_id(), None);
        assert!(!event.is_node_event());
    }

    #[test]
    fn test_event_serializes() {
        let event = RegistryEvent::NodeWentOffline {
            node_id: "n1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"NodeWentOffline":{"node_id":"n1"}}"#);
    }
}
