//! Registry Configuration
//!
//! Settings for the record store, the startup reconciliation pass and the
//! pending-delete reaper. Loaded from YAML, every field has a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Registry Configuration
// =============================================================================

/// Top-level configuration for the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
    /// Startup reconciliation settings
    pub reconcile: ReconcilerConfig,
    /// Pending-delete reaper settings
    pub reaper: ReaperConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("node-registry.db"),
            busy_timeout_ms: 5000,
            reconcile: ReconcilerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would make the registry misbehave
    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout_ms == 0 {
            return Err(Error::Configuration("busy_timeout_ms must be greater than zero".into()));
        }
        if self.reaper.interval_secs == 0 {
            return Err(Error::Configuration(
                "reaper.interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

// =============================================================================
// Reconciler Configuration
// =============================================================================

/// Configuration for the startup online-status reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Stop at the first record that fails to update instead of
    /// continuing and aggregating failures
    pub fail_fast: bool,
    /// Upper bound for the caller's retry loop on transient failures
    pub retry_max_elapsed_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            retry_max_elapsed_secs: 30,
        }
    }
}

// =============================================================================
// Reaper Configuration
// =============================================================================

/// Configuration for the pending-delete reaper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Run the reaper alongside the registry
    pub enabled: bool,
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Minimum age of the pending-delete mark before a record is purged
    pub grace_period_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            grace_period_secs: 3600,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        // chrono::Duration::seconds panics past i64::MAX milliseconds
        chrono::Duration::seconds(self.grace_period_secs.min(i64::MAX as u64 / 1_000) as i64)
    }
}
