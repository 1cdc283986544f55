//! SQLite implementation of the durable backend.
//!
//! One `entries` table keyed by `key`, with the value stored as JSON text
//! and the write timestamp as RFC 3339. Uses WAL mode for better
//! concurrent read performance.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info};

use crate::backend::{DurableBackend, PersistedEntry};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Durable backend storing entries in a SQLite database file.
///
/// The connection is opened lazily by [`open`](DurableBackend::open) and
/// can be re-opened after [`close`](DurableBackend::close).
pub struct SqliteBackend {
    path: PathBuf,
    schema_version: i32,
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    /// Create a backend for the configured database path.
    ///
    /// Does not touch the filesystem; the database is opened on `open`.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            path: config.db_path.clone(),
            schema_version: config.schema_version,
            conn: Mutex::new(None),
        }
    }

    /// The database path this backend writes to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Create the schema if the on-disk version is older than ours.
    fn create_schema(conn: &Connection, version: i32) -> Result<()> {
        let current: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current >= version {
            debug!("Schema up to date (version {})", current);
            return Ok(());
        }

        info!("Creating schema version {}", version);

        conn.execute_batch(
            r#"
            -- Entries table: one row per persisted key
            CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp);
            "#,
        )?;

        conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }
}

impl DurableBackend for SqliteBackend {
    fn open(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|_| Error::Database(rusqlite::Error::InvalidPath(self.path.clone())))?;
            }
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;

        // WAL mode for better concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::create_schema(&conn, self.schema_version)?;

        info!(path = %self.path.display(), "SQLite backend opened");
        *guard = Some(conn);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedEntry>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        let mut stmt = conn.prepare("SELECT key, value, timestamp FROM entries")?;
        let rows = stmt.query_map([], Self::row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, value_json, timestamp_str) = row?;
            let value = serde_json::from_str(&value_json)?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map_err(|e| Error::InvalidData(e.to_string()))?
                .with_timezone(&Utc);
            entries.push(PersistedEntry {
                key,
                value,
                timestamp,
            });
        }

        debug!(count = entries.len(), "loaded persisted entries");
        Ok(entries)
    }

    fn put(&self, entry: &PersistedEntry) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        let value_json = serde_json::to_string(&entry.value)?;
        conn.execute(
            r#"
            INSERT INTO entries (key, value, timestamp)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, timestamp = ?3
            "#,
            params![entry.key, value_json, entry.timestamp.to_rfc3339()],
        )?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        conn.execute("DELETE FROM entries", [])?;
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn close(&self) {
        if self.conn.lock().take().is_some() {
            debug!(path = %self.path.display(), "SQLite backend closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend_at(dir: &tempfile::TempDir) -> SqliteBackend {
        let config = StoreConfig::new(dir.path().join("test.db"));
        SqliteBackend::new(&config)
    }

    #[test]
    fn put_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);
        backend.open().unwrap();

        backend
            .put(&PersistedEntry::new("user.name", json!("hong")))
            .unwrap();
        backend
            .put(&PersistedEntry::new("user.profile", json!({"age": 25})))
            .unwrap();

        let mut entries = backend.load_all().unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "user.name");
        assert_eq!(entries[0].value, json!("hong"));
        assert_eq!(entries[1].value, json!({"age": 25}));
    }

    #[test]
    fn put_overwrites_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);
        backend.open().unwrap();

        backend
            .put(&PersistedEntry::new("k", json!("first")))
            .unwrap();
        backend
            .put(&PersistedEntry::new("k", json!("second")))
            .unwrap();

        let entries = backend.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, json!("second"));
    }

    #[test]
    fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);
        backend.open().unwrap();

        backend.put(&PersistedEntry::new("a", json!(1))).unwrap();
        backend.put(&PersistedEntry::new("b", json!(2))).unwrap();

        backend.remove("a").unwrap();
        assert_eq!(backend.count().unwrap(), 1);

        // Removing an absent key is fine
        backend.remove("a").unwrap();

        backend.clear().unwrap();
        assert_eq!(backend.count().unwrap(), 0);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);
        backend.open().unwrap();
        backend.put(&PersistedEntry::new("k", json!([1, 2, 3]))).unwrap();
        backend.close();

        backend.open().unwrap();
        let entries = backend.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, json!([1, 2, 3]));
    }

    #[test]
    fn closed_backend_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);

        assert!(matches!(backend.load_all(), Err(Error::Closed)));
        assert!(matches!(backend.count(), Err(Error::Closed)));
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_at(&dir);
        backend.open().unwrap();
        backend.open().unwrap();
        assert_eq!(backend.count().unwrap(), 0);
    }
}
