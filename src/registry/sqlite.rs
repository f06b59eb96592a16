//! SQLite Node Store
//!
//! Relational backend for the node registry. A single `nodes` table keyed by
//! an `AUTOINCREMENT` surrogate id (never reused) with a `UNIQUE` natural key
//! on `node_id`.

use crate::domain::ports::{NodeAnnouncement, NodeLookup, NodeRecord, NodeStore};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS nodes (
        id                       INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id                  TEXT NOT NULL UNIQUE,
        name                     TEXT NOT NULL,
        version                  TEXT NOT NULL,
        ip_address               TEXT NOT NULL,
        hostname                 TEXT NOT NULL,
        os_name                  TEXT NOT NULL,
        online                   INTEGER NOT NULL DEFAULT 0,
        query_engine_enabled     INTEGER NOT NULL DEFAULT 0,
        query_engine_version     TEXT,
        query_engine_config_path TEXT,
        pending_delete           INTEGER NOT NULL DEFAULT 0,
        created_at               TEXT NOT NULL,
        updated_at               TEXT NOT NULL
    );
";

const COLUMNS: &str = "id, node_id, name, version, ip_address, hostname, os_name, online,
    query_engine_enabled, query_engine_version, query_engine_config_path, pending_delete,
    created_at, updated_at";

/// SQLite-backed node store
///
/// The connection sits behind a mutex; each operation holds it for the span
/// of its transaction.
pub struct SqliteNodeStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteNodeStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteNodeStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::bootstrap(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?, None)
    }

    fn bootstrap(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path, "Node store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
        Ok(NodeRecord {
            id: row.get(0)?,
            node_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            ip_address: row.get(4)?,
            hostname: row.get(5)?,
            os_name: row.get(6)?,
            online: row.get(7)?,
            query_engine_enabled: row.get(8)?,
            query_engine_version: row.get(9)?,
            query_engine_config_path: row.get(10)?,
            pending_delete: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    /// Overwrite every column except `id` and `created_at`.
    ///
    /// Returns the number of rows touched (0 when the id is gone).
    fn write_columns(
        tx: &Transaction<'_>,
        record: &NodeRecord,
        updated_at: DateTime<Utc>,
    ) -> Result<usize> {
        tx.execute(
            "UPDATE nodes SET
                node_id = ?2, name = ?3, version = ?4, ip_address = ?5, hostname = ?6,
                os_name = ?7, online = ?8, query_engine_enabled = ?9,
                query_engine_version = ?10, query_engine_config_path = ?11,
                pending_delete = ?12, updated_at = ?13
             WHERE id = ?1",
            params![
                record.id,
                record.node_id,
                record.name,
                record.version,
                record.ip_address,
                record.hostname,
                record.os_name,
                record.online,
                record.query_engine_enabled,
                record.query_engine_version,
                record.query_engine_config_path,
                record.pending_delete,
                updated_at,
            ],
        )
        .map_err(|e| Self::map_unique_violation(e, &record.node_id))
    }

    fn map_unique_violation(err: rusqlite::Error, node_id: &str) -> Error {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Error::DuplicateNodeId {
                    node_id: node_id.to_string(),
                }
            }
            _ => Error::Store(err),
        }
    }
}

impl NodeStore for SqliteNodeStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn find_all(&self) -> Result<Vec<NodeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes ORDER BY id", COLUMNS))?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn find_by_node_id(&self, node_id: &str) -> Result<NodeLookup> {
        debug!(node_id, "Looking for node");

        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE node_id = ?1", COLUMNS),
                params![node_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record.into())
    }

    fn upsert_from_announcement(&self, announcement: &NodeAnnouncement) -> Result<NodeRecord> {
        announcement.validate()?;

        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock at BEGIN so the read-modify-write
        // below can't interleave with another writer on the same file.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!("SELECT {} FROM nodes WHERE node_id = ?1", COLUMNS),
                params![announcement.node_id],
                Self::row_to_record,
            )
            .optional()?;

        let now = Utc::now();
        let record = match existing {
            Some(mut record) => {
                debug!(node_id = %record.node_id, id = record.id, "Found existing node record");
                record.apply_announcement(announcement);
                Self::write_columns(&tx, &record, now)?;
                record.updated_at = now;
                record
            }
            None => {
                debug!(node_id = %announcement.node_id, "Creating a new node record");
                let mut record = NodeRecord::from_announcement(0, announcement, now);
                tx.execute(
                    "INSERT INTO nodes (
                        node_id, name, version, ip_address, hostname, os_name, online,
                        query_engine_enabled, query_engine_version, query_engine_config_path,
                        pending_delete, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                    params![
                        record.node_id,
                        record.name,
                        record.version,
                        record.ip_address,
                        record.hostname,
                        record.os_name,
                        record.online,
                        record.query_engine_enabled,
                        record.query_engine_version,
                        record.query_engine_config_path,
                        record.pending_delete,
                        now,
                    ],
                )?;
                record.id = tx.last_insert_rowid();
                record
            }
        };

        tx.commit()?;
        Ok(record)
    }

    fn update(&self, record: &mut NodeRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let now = Utc::now();
        // An early return drops `tx`, which rolls it back
        if Self::write_columns(&tx, record, now)? == 0 {
            return Err(Error::NodeNotFound {
                node_id: record.node_id.clone(),
            });
        }
        tx.commit()?;

        record.updated_at = now;
        Ok(())
    }

    fn delete(&self, record: &NodeRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if tx.execute("DELETE FROM nodes WHERE id = ?1", params![record.id])? == 0 {
            return Err(Error::NodeNotFound {
                node_id: record.node_id.clone(),
            });
        }
        tx.commit()?;

        debug!(node_id = %record.node_id, id = record.id, "Deleted node record");
        Ok(())
    }

    fn purge_pending_delete(&self, record: &NodeRecord, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock();
        // Hold the write lock from the re-read through the delete
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1", COLUMNS),
                params![record.id],
                Self::row_to_record,
            )
            .optional()?;

        match current {
            Some(current) if current.is_purgeable(cutoff) => {
                tx.execute("DELETE FROM nodes WHERE id = ?1", params![current.id])?;
                tx.commit()?;
                debug!(node_id = %current.node_id, id = current.id, "Purged node record");
                Ok(true)
            }
            Some(current) => {
                debug!(
                    node_id = %current.node_id,
                    online = current.online,
                    pending_delete = current.pending_delete,
                    "Node changed since scan, not purging"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
