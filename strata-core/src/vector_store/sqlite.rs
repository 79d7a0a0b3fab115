use super::{l2_distance, nearest, VectorHit, VectorRow, VectorStore};
use crate::error::StrataError;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const PARTITION_EXT: &str = "sqlite";

/// One SQLite file per partition; search is a full scan.
pub struct SqliteVectorStore {
    dir: PathBuf,
    open: Mutex<HashMap<String, Connection>>,
}

impl SqliteVectorStore {
    pub fn open(dir: &Path) -> crate::Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StrataError::StoreUnavailable {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            open: Mutex::new(HashMap::new()),
        })
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{PARTITION_EXT}"))
    }

    /// Run `f` on the partition's connection, creating the file when
    /// `create` is set. `None` when the partition does not exist.
    fn with_partition<T>(
        &self,
        name: &str,
        create: bool,
        f: impl FnOnce(&mut Connection) -> crate::Result<T>,
    ) -> crate::Result<Option<T>> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| StrataError::VectorStore("partition lock poisoned".to_string()))?;
        if !open.contains_key(name) {
            let file = self.file_for(name);
            if !create && !file.exists() {
                return Ok(None);
            }
            let conn = Connection::open(&file)?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                CREATE TABLE IF NOT EXISTS vectors (
                    uuid TEXT NOT NULL,
                    path TEXT NOT NULL,
                    cache_key TEXT NOT NULL,
                    vector BLOB NOT NULL,
                    PRIMARY KEY (uuid, path)
                );
                CREATE INDEX IF NOT EXISTS idx_vectors_key ON vectors(cache_key, path);
                ",
            )?;
            debug!(partition = name, "opened vector partition");
            open.insert(name.to_string(), conn);
        }
        match open.get_mut(name) {
            Some(conn) => f(conn).map(Some),
            None => Ok(None),
        }
    }
}

fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn write_rows(conn: &mut Connection, rows: &[VectorRow]) -> crate::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO vectors (uuid, path, cache_key, vector) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in rows {
            stmt.execute(params![row.uuid, row.path, row.cache_key, encode(&row.vector)])?;
        }
    }
    tx.commit()?;
    Ok(())
}

impl VectorStore for SqliteVectorStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn has_partition(&self, name: &str) -> crate::Result<bool> {
        let open = self
            .open
            .lock()
            .map_err(|_| StrataError::VectorStore("partition lock poisoned".to_string()))?;
        Ok(open.contains_key(name) || self.file_for(name).exists())
    }

    fn create_partition(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()> {
        self.with_partition(name, true, |conn| write_rows(conn, rows))?;
        Ok(())
    }

    fn insert(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()> {
        self.with_partition(name, false, |conn| write_rows(conn, rows))?
            .ok_or_else(|| StrataError::VectorStore(format!("no partition {name}")))
    }

    fn delete(&self, name: &str, cache_key: &str, path: Option<&str>) -> crate::Result<usize> {
        let removed = self.with_partition(name, false, |conn| {
            let n = match path {
                Some(p) => conn.execute(
                    "DELETE FROM vectors WHERE cache_key = ?1 AND path = ?2",
                    params![cache_key, p],
                )?,
                None => conn.execute("DELETE FROM vectors WHERE cache_key = ?1", params![cache_key])?,
            };
            Ok(n)
        })?;
        Ok(removed.unwrap_or(0))
    }

    fn search(&self, name: &str, query: &[f32], limit: usize) -> crate::Result<Vec<VectorHit>> {
        let hits = self.with_partition(name, false, |conn| {
            let mut stmt = conn.prepare_cached("SELECT uuid, path, cache_key, vector FROM vectors")?;
            let hits = stmt
                .query_map([], |row| {
                    let bytes: Vec<u8> = row.get(3)?;
                    Ok(VectorHit {
                        uuid: row.get(0)?,
                        path: row.get(1)?,
                        cache_key: row.get(2)?,
                        distance: l2_distance(query, &decode(&bytes)),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nearest(hits, limit))
        })?;
        Ok(hits.unwrap_or_default())
    }

    fn partitions(&self) -> crate::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == PARTITION_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn clear(&self) -> crate::Result<()> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| StrataError::VectorStore("partition lock poisoned".to_string()))?;
        open.clear();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
