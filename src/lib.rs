//! Node Registry - Persistent record of connected agents
//!
//! The authoritative ledger of which nodes a controlling server knows about,
//! their identity and capability metadata, and their last recorded
//! connection state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Hosting Server                            │
//! │   startup ──► reconcile     connect / disconnect / cleanup       │
//! └───────┬──────────────────────────────┬───────────────────────────┘
//!         │                              │
//! ┌───────┴──────────────────────────────┴───────────────────────────┐
//! │                        NodeRegistry                              │
//! │  ┌──────────────────────┐   ┌──────────────────────────────────┐ │
//! │  │ Connection Reconciler│   │ stats · events · reconcile gate  │ │
//! │  └──────────┬───────────┘   └────────────────┬─────────────────┘ │
//! │             └──────────────┬─────────────────┘                   │
//! │                    ┌───────┴────────┐       ┌──────────────────┐ │
//! │                    │   NodeStore    │◄──────┤ PendingDelete    │ │
//! │                    │    (port)      │       │ Reaper           │ │
//! │                    └───────┬────────┘       └──────────────────┘ │
//! ├────────────────────────────┼─────────────────────────────────────┤
//! │            ┌───────────────┴───────────────┐                     │
//! │            │ SqliteNodeStore │ MemoryNodeStore                   │
//! │            └───────────────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Store backends, reconciler, registry handle, reaper
//! - [`domain`]: Node record types and the `NodeStore` port
//! - [`config`]: Registry configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod registry;

// Re-export commonly used types
pub use config::{ReaperConfig, ReconcilerConfig, RegistryConfig};

pub use domain::ports::{NodeAnnouncement, NodeLookup, NodeRecord, NodeStore};

pub use error::{Error, ErrorAction, Result};

pub use registry::{
    ConnectionReconciler, MemoryNodeStore, NodeRegistry, PendingDeleteReaper, ReconcileReport,
    RegistryEvent, RegistryStatsSnapshot, SqliteNodeStore, SweepReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
