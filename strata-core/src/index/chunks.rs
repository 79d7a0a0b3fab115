//! Persisted chunks, the input of the lexical index.

use super::{Chunk, CodebaseIndex};
use crate::chunker::ChunkPolicy;
use crate::store::Store;
use crate::tag::{IndexTag, PathAndCacheKey};
use crate::workspace::Workspace;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CHUNKS_ARTIFACT_ID: &str = "chunks";

pub struct ChunkIndex {
    store: Arc<Store>,
    workspace: Arc<dyn Workspace>,
    policy: ChunkPolicy,
}

impl ChunkIndex {
    pub fn new(
        store: Arc<Store>,
        workspace: Arc<dyn Workspace>,
        policy: ChunkPolicy,
    ) -> crate::Result<Self> {
        create_tables(&*store.conn()?)?;
        Ok(Self {
            store,
            workspace,
            policy,
        })
    }

    /// Every chunk stored for `cache_key`, in file order.
    pub fn chunks_for(&self, cache_key: &str) -> crate::Result<Vec<Chunk>> {
        let conn = self.store.conn()?;
        chunks_for(&conn, cache_key)
    }
}

pub(crate) fn create_tables(conn: &Connection) -> crate::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY,
            cache_key TEXT NOT NULL,
            path TEXT NOT NULL,
            idx INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content TEXT NOT NULL,
            UNIQUE (cache_key, idx)
        );

        CREATE TABLE IF NOT EXISTS chunk_tags (
            id INTEGER PRIMARY KEY,
            cache_key TEXT NOT NULL,
            tag TEXT NOT NULL,
            path TEXT NOT NULL,
            UNIQUE (cache_key, tag, path)
        );
        CREATE INDEX IF NOT EXISTS idx_chunk_tags_tag ON chunk_tags(tag);
        ",
    )?;
    Ok(())
}

pub(crate) fn chunks_for(conn: &Connection, cache_key: &str) -> crate::Result<Vec<Chunk>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, idx, start_line, end_line, content FROM chunks
         WHERE cache_key = ?1 ORDER BY idx",
    )?;
    let chunks = stmt
        .query_map(params![cache_key], |row| {
            Ok(Chunk {
                filepath: row.get(0)?,
                cache_key: cache_key.to_string(),
                index: row.get::<_, i64>(1)? as usize,
                start_line: row.get::<_, i64>(2)? as usize,
                end_line: row.get::<_, i64>(3)? as usize,
                content: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(chunks)
}

fn has_chunks(conn: &Connection, cache_key: &str) -> crate::Result<bool> {
    let found: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM chunks WHERE cache_key = ?1 LIMIT 1")?
        .query_row(params![cache_key], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn link(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO chunk_tags (cache_key, tag, path) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

fn unlink(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached("DELETE FROM chunk_tags WHERE cache_key = ?1 AND tag = ?2 AND path = ?3")?
        .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

impl CodebaseIndex for ChunkIndex {
    fn artifact_id(&self) -> String {
        CHUNKS_ARTIFACT_ID.to_string()
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()> {
        for item in items {
            let exists = has_chunks(&*self.store.conn()?, &item.cache_key)?;
            // Read and split outside the store lock.
            let pieces = if exists {
                Vec::new()
            } else {
                match self.workspace.read_file(&item.path) {
                    Ok(bytes) => {
                        let content = String::from_utf8_lossy(&bytes);
                        self.policy.chunk_document(&item.path, &content)
                    }
                    Err(e) => {
                        warn!(path = %item.path, error = %e, "could not read file for chunking");
                        Vec::new()
                    }
                }
            };

            let mut conn = self.store.conn()?;
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT OR IGNORE INTO chunks (cache_key, path, idx, start_line, end_line, content)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (idx, piece) in pieces.iter().enumerate() {
                    insert.execute(params![
                        item.cache_key,
                        item.path,
                        idx as i64,
                        piece.start_line as i64,
                        piece.end_line as i64,
                        piece.content,
                    ])?;
                }
            }
            link(&tx, tag, item)?;
            tx.commit()?;
            debug!(path = %item.path, chunks = pieces.len(), reused = exists, "chunked");
        }
        Ok(())
    }

    fn add_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        link(&*self.store.conn()?, tag, item)
    }

    fn remove_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        unlink(&*self.store.conn()?, tag, item)
    }

    fn delete(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        unlink(&tx, tag, item)?;
        tx.execute("DELETE FROM chunks WHERE cache_key = ?1", params![item.cache_key])?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> crate::Result<()> {
        self.store
            .conn()?
            .execute_batch("DELETE FROM chunks; DELETE FROM chunk_tags;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::workspace::LastModifiedMap;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    struct Files(HashMap<String, String>);

    impl Workspace for Files {
        fn list_files(&self, _root: &Path) -> crate::Result<LastModifiedMap> {
            Ok(LastModifiedMap::new())
        }
        fn read_file(&self, path: &str) -> crate::Result<Vec<u8>> {
            self.0
                .get(path)
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
        }
        fn current_branch(&self, _root: &Path) -> String {
            "main".to_string()
        }
    }

    fn index(files: &[(&str, &str)]) -> (TempDir, ChunkIndex) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let workspace = Arc::new(Files(
            files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
        ));
        let policy = ChunkPolicy::from_config(&IndexingConfig::default());
        (dir, ChunkIndex::new(store, workspace, policy).unwrap())
    }

    fn tag_count(index: &ChunkIndex) -> i64 {
        index
            .store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM chunk_tags", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_compute_stores_chunks_and_links() {
        let (_dir, index) = index(&[("/r/a.py", "def f():\n    return 1\n")]);
        let tag = IndexTag::new("/r", "main", CHUNKS_ARTIFACT_ID);
        let item = PathAndCacheKey::new("/r/a.py", "k");
        index.compute(&tag, &[item]).unwrap();

        let chunks = index.chunks_for("k").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert!(chunks[0].content.contains("return 1"));
        assert_eq!(tag_count(&index), 1);
    }

    #[test]
    fn test_compute_for_known_key_only_links() {
        let (_dir, index) = index(&[("/r/a.py", "def f():\n    pass\n")]);
        let main = IndexTag::new("/r", "main", CHUNKS_ARTIFACT_ID);
        let dev = IndexTag::new("/r", "dev", CHUNKS_ARTIFACT_ID);
        index.compute(&main, &[PathAndCacheKey::new("/r/a.py", "k")]).unwrap();
        // The path is gone from the workspace; compute must not need it.
        index.compute(&dev, &[PathAndCacheKey::new("/r/missing.py", "k")]).unwrap();

        assert_eq!(index.chunks_for("k").unwrap().len(), 1);
        assert_eq!(tag_count(&index), 2);
    }

    #[test]
    fn test_remove_tag_keeps_chunks_delete_drops_them() {
        let (_dir, index) = index(&[("/r/a.py", "x = 1\n")]);
        let tag = IndexTag::new("/r", "main", CHUNKS_ARTIFACT_ID);
        let item = PathAndCacheKey::new("/r/a.py", "k");
        index.compute(&tag, std::slice::from_ref(&item)).unwrap();

        index.remove_tag(&tag, &item).unwrap();
        assert_eq!(tag_count(&index), 0);
        assert_eq!(index.chunks_for("k").unwrap().len(), 1);

        index.add_tag(&tag, &item).unwrap();
        index.delete(&tag, &item).unwrap();
        assert_eq!(tag_count(&index), 0);
        assert!(index.chunks_for("k").unwrap().is_empty());
    }
}
