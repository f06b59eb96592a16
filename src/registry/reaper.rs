//! Pending-Delete Reaper
//!
//! Purges records flagged `pending_delete` once they are offline and the
//! flag has aged past a grace period. Runs beside the registry, never inside
//! a store operation.

use super::node_registry::NodeRegistry;
use crate::config::ReaperConfig;
use crate::domain::ports::NodeRecord;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one reaper sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records physically removed
    pub purged: usize,
    /// Flagged records left alone: not yet due, or changed since the scan
    pub skipped: usize,
    /// Records whose purge failed
    pub failed: usize,
}

/// Periodically deletes records marked for removal
pub struct PendingDeleteReaper {
    registry: Arc<NodeRegistry>,
    config: ReaperConfig,
}

impl PendingDeleteReaper {
    pub fn new(registry: Arc<NodeRegistry>, config: ReaperConfig) -> Self {
        Self { registry, config }
    }

    /// Latest `updated_at` a record may carry and still be purged at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.config.grace_period())
    }

    /// Whether a record may be purged at `now`
    pub fn is_expired(&self, record: &NodeRecord, now: DateTime<Utc>) -> bool {
        self.cutoff(now)
            .is_some_and(|cutoff| record.is_purgeable(cutoff))
    }

    /// Run one sweep.
    ///
    /// The store re-checks every candidate inside the delete, so a node that
    /// reconnects after the scan survives. A record that fails to purge is
    /// logged, counted and skipped; only a failed scan aborts the sweep.
    pub fn sweep(&self) -> Result<SweepReport> {
        let cutoff = self.cutoff(Utc::now());
        let mut report = SweepReport::default();

        for record in self.registry.pending_delete_nodes()? {
            let cutoff = match cutoff {
                Some(cutoff) if record.is_purgeable(cutoff) => cutoff,
                _ => {
                    debug!(node_id = %record.node_id, "Pending delete not yet due");
                    report.skipped += 1;
                    continue;
                }
            };
            match self.registry.purge_pending_delete(&record, cutoff) {
                Ok(true) => report.purged += 1,
                Ok(false) => {
                    debug!(node_id = %record.node_id, "Node changed since scan, kept");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(node_id = %record.node_id, error = %e, "Failed to purge node");
                    report.failed += 1;
                }
            }
        }

        if report.purged > 0 || report.failed > 0 {
            info!(
                purged = report.purged,
                skipped = report.skipped,
                failed = report.failed,
                "Pending-delete sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep on an interval until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval_secs,
            grace_period_secs = self.config.grace_period_secs,
            "Pending-delete reaper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %e, "Reaper sweep failed");
                    }
                }
            }
        }

        info!("Pending-delete reaper stopped");
    }
}
