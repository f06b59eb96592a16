//! Connection Reconciler
//!
//! Repairs `online` flags left behind by an ungraceful shutdown. At startup
//! no node session can be live yet, so every record still claiming to be
//! online is forced offline. `online -> offline` is the only transition made
//! here; a second pass finds nothing to do.
//!
//! Each correction is its own store transaction. A failed record never
//! undoes corrections that already committed.

use crate::config::ReconcilerConfig;
use crate::domain::ports::NodeStore;
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of a successful reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records read from the store
    pub scanned: usize,
    /// Records switched from online to offline
    pub corrected: usize,
    /// Records that were already offline and left untouched
    pub already_offline: usize,
}

/// Forces every online record offline
#[derive(Debug, Clone, Default)]
pub struct ConnectionReconciler {
    config: ReconcilerConfig,
}

impl ConnectionReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation pass over `store`.
    ///
    /// With `fail_fast` the pass stops at the first record that can't be
    /// updated. Otherwise it carries on and reports every failed node. In both
    /// cases a failure comes back as `Error::ReconcileIncomplete`.
    pub fn reconcile(&self, store: &dyn NodeStore) -> Result<ReconcileReport> {
        let nodes = store.find_all()?;
        let total = nodes.iter().filter(|node| node.online).count();

        let mut report = ReconcileReport {
            scanned: nodes.len(),
            ..Default::default()
        };
        let mut failed = Vec::new();
        let mut first_error = None;

        for mut node in nodes {
            if !node.online {
                report.already_offline += 1;
                continue;
            }

            node.online = false;
            match store.update(&mut node) {
                Ok(()) => {
                    debug!(node_id = %node.node_id, "Marked stale node offline");
                    report.corrected += 1;
                }
                // Deleted since the scan, nothing left to correct
                Err(Error::NodeNotFound { .. }) => {
                    debug!(node_id = %node.node_id, "Node vanished during reconciliation");
                }
                Err(err) => {
                    warn!(node_id = %node.node_id, error = %err, "Failed to mark node offline");
                    failed.push(node.node_id);
                    first_error.get_or_insert(err);
                    if self.config.fail_fast {
                        break;
                    }
                }
            }
        }

        if let Some(source) = first_error {
            return Err(Error::ReconcileIncomplete {
                corrected: report.corrected,
                total,
                failed,
                source: Box::new(source),
            });
        }

        info!(
            backend = store.backend(),
            scanned = report.scanned,
            corrected = report.corrected,
            "Online status reconciled"
        );
        Ok(report)
    }
}
