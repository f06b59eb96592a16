//! Node Registry Module
//!
//! Persistent record store backends, the startup connection reconciler and
//! the shared registry handle built on top of them.

pub mod events;
pub mod memory;
pub mod node_registry;
pub mod reaper;
pub mod reconciler;
pub mod sqlite;

pub use events::*;
pub use memory::MemoryNodeStore;
pub use node_registry::*;
pub use reaper::{PendingDeleteReaper, SweepReport};
pub use reconciler::{ConnectionReconciler, ReconcileReport};
pub use sqlite::SqliteNodeStore;
