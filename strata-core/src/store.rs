//! The embedded relational store shared by every index.

use crate::error::StrataError;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

const SCHEMA_VERSION: i32 = 1;

/// File name of the relational store inside the index directory.
pub const INDEX_DB_FILE: &str = "index.sqlite";
/// Directory holding vector partitions inside the index directory.
pub const VECTOR_DIR: &str = "vectors";

/// Explicitly opened store handle. One per process; hand it to every index.
///
/// The connection sits behind a mutex, so writes from one process are
/// serialized.
pub struct Store {
    index_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create `<index_dir>/index.sqlite`.
    pub fn open(index_dir: &Path) -> crate::Result<Arc<Self>> {
        let unavailable = |message: String| StrataError::StoreUnavailable {
            path: index_dir.to_path_buf(),
            message,
        };

        fs::create_dir_all(index_dir).map_err(|e| unavailable(e.to_string()))?;
        let conn = Connection::open(index_dir.join(INDEX_DB_FILE))
            .map_err(|e| unavailable(e.to_string()))?;
        Self::init_schema(&conn)?;

        info!(dir = %index_dir.display(), "opened index store");
        Ok(Arc::new(Self {
            index_dir: index_dir.to_path_buf(),
            conn: Mutex::new(conn),
        }))
    }

    fn init_schema(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            ",
        )?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version != 0 && version != SCHEMA_VERSION {
            return Err(StrataError::SchemaVersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        if version == 0 {
            conn.execute_batch(
                "
                -- What each partition currently holds, one row per (tag, path)
                CREATE TABLE IF NOT EXISTS tag_catalog (
                    id INTEGER PRIMARY KEY,
                    dir TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    artifact_id TEXT NOT NULL,
                    path TEXT NOT NULL,
                    cache_key TEXT NOT NULL,
                    last_updated INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tag_catalog_path
                    ON tag_catalog(dir, branch, artifact_id, path);

                -- Content membership: one row per referencing (tag, path)
                CREATE TABLE IF NOT EXISTS global_cache (
                    id INTEGER PRIMARY KEY,
                    cache_key TEXT NOT NULL,
                    dir TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    artifact_id TEXT NOT NULL,
                    path TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_global_cache_ref
                    ON global_cache(cache_key, artifact_id, dir, branch, path);

                PRAGMA user_version = 1;
                ",
            )?;
        }

        Ok(())
    }

    /// Lock the connection for one unit of work.
    pub fn conn(&self) -> crate::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StrataError::StoreLockPoisoned)
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.index_dir.join(VECTOR_DIR)
    }

    /// Drop every catalog and membership row. Index tables are cleared by
    /// their owners.
    pub fn clear_core_tables(&self) -> crate::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("DELETE FROM tag_catalog; DELETE FROM global_cache;")?;
        Ok(())
    }
}
