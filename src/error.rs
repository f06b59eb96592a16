//! Error types for the Node Registry
//!
//! Provides structured error types for the record store, the connection
//! reconciler, the pending-delete reaper and configuration loading.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the registry
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Store backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    // =========================================================================
    // Node Record Errors
    // =========================================================================
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Node id already in use by another record: {node_id}")]
    DuplicateNodeId { node_id: String },

    #[error("Invalid node announcement: {0}")]
    InvalidAnnouncement(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Registry has not reconciled online status since startup")]
    NotReconciled,

    #[error(
        "Online status reconciliation incomplete: corrected {corrected} of {total}, failed nodes: {failed:?}: {source}"
    )]
    ReconcileIncomplete {
        corrected: usize,
        total: usize,
        failed: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, the failure needs operator attention
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        if self.is_transient() {
            return ErrorAction::RetryWithBackoff;
        }

        match self {
            // Reconnect before the sweep finished, try again shortly
            Error::NotReconciled => ErrorAction::RetryAfter(Duration::from_secs(1)),

            // Validation, lookup and constraint failures won't fix themselves
            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient (lock contention, unavailable backend)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::BackendUnavailable { .. } => true,
            Error::ReconcileIncomplete { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this error originates in the persistence backend,
    /// constraint violations included
    pub fn is_store_error(&self) -> bool {
        match self {
            Error::Store(_) | Error::BackendUnavailable { .. } | Error::DuplicateNodeId { .. } => {
                true
            }
            Error::ReconcileIncomplete { source, .. } => source.is_store_error(),
            _ => false,
        }
    }
}

/// Result type alias for the registry
pub type Result<T> = std::result::Result<T, Error>;
