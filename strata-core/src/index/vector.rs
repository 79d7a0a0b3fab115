//! Embedding index: one vector partition per tag plus a relational mirror
//! that lets other tags reuse embeddings without calling the provider.

use super::{Chunk, CodebaseIndex, ProgressModel};
use crate::chunker::{ChunkPolicy, RawChunk};
use crate::config::VectorConfig;
use crate::embed::Embedder;
use crate::error::StrataError;
use crate::store::Store;
use crate::tag::{partition_name, BranchAndDir, IndexTag, PathAndCacheKey};
use crate::vector_store::{VectorRow, VectorStore, VectorStoreStatus};
use crate::workspace::Workspace;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VECTOR_ARTIFACT_PREFIX: &str = "vectordb::";

/// A mirror row: one embedded chunk of one cache key.
#[derive(Debug, Clone)]
struct MirrorRow {
    uuid: String,
    cache_key: String,
    path: String,
    idx: usize,
    vector: Vec<f32>,
    start_line: usize,
    end_line: usize,
    contents: String,
}

pub struct VectorIndex {
    store: Arc<Store>,
    workspace: Arc<dyn Workspace>,
    embedder: Arc<dyn Embedder>,
    vectors: Result<Arc<dyn VectorStore>, String>,
    policy: ChunkPolicy,
    config: VectorConfig,
}

impl VectorIndex {
    pub fn new(
        store: Arc<Store>,
        workspace: Arc<dyn Workspace>,
        embedder: Arc<dyn Embedder>,
        status: VectorStoreStatus,
        policy: ChunkPolicy,
        config: VectorConfig,
    ) -> crate::Result<Self> {
        store.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS vector_cache (
                uuid TEXT PRIMARY KEY,
                cache_key TEXT NOT NULL,
                path TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                vector TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                contents TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vector_cache_key
                ON vector_cache(cache_key, artifact_id);
            ",
        )?;

        let vectors = match status {
            VectorStoreStatus::Ready(vectors) => Ok(vectors),
            VectorStoreStatus::Unsupported { backend, reason } => {
                Err(format!("vector backend '{backend}' unsupported: {reason}"))
            }
            VectorStoreStatus::Failed(e) => Err(e.to_string()),
        };
        let policy = policy.with_max_tokens(embedder.max_chunk_tokens());

        Ok(Self {
            store,
            workspace,
            embedder,
            vectors,
            policy,
            config,
        })
    }

    fn vectors(&self) -> crate::Result<&Arc<dyn VectorStore>> {
        self.vectors.as_ref().map_err(|message| StrataError::StoreUnavailable {
            path: self.store.vector_dir(),
            message: message.clone(),
        })
    }

    fn mirror_rows(&self, conn: &Connection, cache_key: &str) -> crate::Result<Vec<MirrorRow>> {
        let mut stmt = conn.prepare_cached(
            "SELECT uuid, path, idx, vector, start_line, end_line, contents FROM vector_cache
             WHERE cache_key = ?1 AND artifact_id = ?2 ORDER BY idx",
        )?;
        let raw = stmt
            .query_map(params![cache_key, self.artifact_id()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (uuid, path, idx, vector, start_line, end_line, contents) in raw {
            rows.push(MirrorRow {
                uuid,
                cache_key: cache_key.to_string(),
                path,
                idx: idx as usize,
                vector: serde_json::from_str(&vector)?,
                start_line: start_line as usize,
                end_line: end_line as usize,
                contents,
            });
        }
        Ok(rows)
    }

    fn write_mirror(&self, cache_key: &str, rows: &[MirrorRow]) -> crate::Result<()> {
        let artifact_id = self.artifact_id();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM vector_cache WHERE cache_key = ?1 AND artifact_id = ?2",
            params![cache_key, artifact_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO vector_cache
                 (uuid, cache_key, path, artifact_id, idx, vector, start_line, end_line, contents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.uuid,
                    row.cache_key,
                    row.path,
                    artifact_id,
                    row.idx as i64,
                    serde_json::to_string(&row.vector)?,
                    row.start_line as i64,
                    row.end_line as i64,
                    row.contents,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the rows for `item` in the tag's partition with `rows`.
    fn write_partition(
        &self,
        tag: &IndexTag,
        item: &PathAndCacheKey,
        rows: &[MirrorRow],
    ) -> crate::Result<()> {
        let vectors = self.vectors()?;
        let name = partition_name(tag);
        let rows: Vec<VectorRow> = rows
            .iter()
            .map(|r| VectorRow {
                uuid: r.uuid.clone(),
                path: item.path.clone(),
                cache_key: r.cache_key.clone(),
                vector: r.vector.clone(),
            })
            .collect();

        if vectors.has_partition(&name)? {
            vectors.delete(&name, &item.cache_key, Some(&item.path))?;
            if !rows.is_empty() {
                vectors.insert(&name, &rows)?;
            }
        } else if !rows.is_empty() {
            info!(partition = %name, "creating vector partition");
            vectors.create_partition(&name, &rows)?;
        }
        Ok(())
    }

    /// Embed the chunks of every item of a batch in one provider call.
    fn embed_new(
        &self,
        pending: Vec<(PathAndCacheKey, Vec<RawChunk>)>,
    ) -> crate::Result<Vec<(PathAndCacheKey, Vec<MirrorRow>)>> {
        let texts: Vec<String> = pending
            .iter()
            .flat_map(|(_, chunks)| chunks.iter().map(|c| c.content.clone()))
            .collect();
        let mut embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder
                .embed(&texts)
                .map_err(|e| StrataError::Embedding {
                    provider: self.embedder.id().to_string(),
                    chunks: texts.len(),
                    message: e.to_string(),
                })?
        };
        // A short result drops the tail.
        embeddings.resize(texts.len(), None);

        let mut slots = embeddings.into_iter();
        let mut dropped = 0usize;
        let mut out = Vec::with_capacity(pending.len());
        for (item, chunks) in pending {
            let mut rows = Vec::with_capacity(chunks.len());
            for (idx, chunk) in chunks.into_iter().enumerate() {
                match slots.next().flatten() {
                    Some(vector) if !vector.is_empty() => rows.push(MirrorRow {
                        uuid: uuid::Uuid::new_v4().to_string(),
                        cache_key: item.cache_key.clone(),
                        path: item.path.clone(),
                        idx,
                        vector,
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        contents: chunk.content,
                    }),
                    _ => dropped += 1,
                }
            }
            out.push((item, rows));
        }
        if dropped > 0 {
            warn!(provider = self.embedder.id(), dropped, "chunks could not be embedded");
        }
        Ok(out)
    }

    /// The `n` nearest chunks to `query` across `tags`.
    pub fn retrieve(
        &self,
        query: &str,
        n: usize,
        tags: &[BranchAndDir],
        path_filter: Option<&str>,
    ) -> crate::Result<Vec<Chunk>> {
        if n == 0 || tags.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.vectors()?;
        let embedded = self
            .embedder
            .embed(&[query.to_string()])
            .map_err(|e| StrataError::Embedding {
                provider: self.embedder.id().to_string(),
                chunks: 1,
                message: e.to_string(),
            })?;
        let Some(Some(query_vector)) = embedded.into_iter().next() else {
            return Err(StrataError::Embedding {
                provider: self.embedder.id().to_string(),
                chunks: 1,
                message: "no embedding returned for query".to_string(),
            });
        };

        let limit = if path_filter.is_some() {
            self.config.path_filter_overfetch.max(n)
        } else {
            n
        };
        let artifact_id = self.artifact_id();
        let mut hits = Vec::new();
        for tag in tags {
            let name = partition_name(&tag.with_artifact(&artifact_id));
            if !vectors.has_partition(&name)? {
                debug!(partition = %name, "no vector partition for tag");
                continue;
            }
            hits.extend(
                vectors
                    .search(&name, &query_vector, limit)?
                    .into_iter()
                    .filter(|hit| path_filter.map_or(true, |prefix| hit.path.starts_with(prefix))),
            );
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(n);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.store.conn()?;
        let placeholders = vec!["?"; hits.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT uuid, cache_key, idx, start_line, end_line, contents FROM vector_cache
             WHERE uuid IN ({placeholders})"
        ))?;
        let by_uuid: HashMap<String, Chunk> = stmt
            .query_map(params_from_iter(hits.iter().map(|h| &h.uuid)), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Chunk {
                        filepath: String::new(),
                        cache_key: row.get(1)?,
                        index: row.get::<_, i64>(2)? as usize,
                        start_line: row.get::<_, i64>(3)? as usize,
                        end_line: row.get::<_, i64>(4)? as usize,
                        content: row.get(5)?,
                    },
                ))
            })?
            .collect::<Result<_, _>>()?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                // one uuid may sit at several paths of the same tag
                by_uuid.get(&hit.uuid).cloned().map(|mut chunk| {
                    chunk.filepath = hit.path;
                    chunk
                })
            })
            .collect())
    }
}

impl CodebaseIndex for VectorIndex {
    fn artifact_id(&self) -> String {
        format!("{VECTOR_ARTIFACT_PREFIX}{}", self.embedder.id())
    }

    fn progress_model(&self) -> ProgressModel {
        ProgressModel::ThreePhase
    }

    fn compute_batch_size(&self) -> usize {
        self.config.files_per_embed_batch.max(1)
    }

    fn begin(&self, _tag: &IndexTag) -> crate::Result<()> {
        self.vectors().map(|_| ())
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()> {
        let mut ready = Vec::new();
        let mut pending = Vec::new();
        // Later paths of a key already pending in this batch share its rows.
        let mut followers = Vec::new();
        let mut claimed: HashSet<&str> = HashSet::new();
        for item in items {
            if claimed.contains(item.cache_key.as_str()) {
                followers.push(item.clone());
                continue;
            }
            let known = {
                let conn = self.store.conn()?;
                self.mirror_rows(&conn, &item.cache_key)?
            };
            if !known.is_empty() {
                ready.push((item.clone(), known));
                continue;
            }
            let chunks = match self.workspace.read_file(&item.path) {
                Ok(bytes) => self
                    .policy
                    .chunk_document(&item.path, &String::from_utf8_lossy(&bytes)),
                Err(e) => {
                    warn!(path = %item.path, error = %e, "could not read file for embedding");
                    Vec::new()
                }
            };
            claimed.insert(item.cache_key.as_str());
            pending.push((item.clone(), chunks));
        }

        let mut embedded: HashMap<String, Vec<MirrorRow>> = HashMap::new();
        for (item, rows) in self.embed_new(pending)? {
            self.write_mirror(&item.cache_key, &rows)?;
            embedded.insert(item.cache_key.clone(), rows.clone());
            ready.push((item, rows));
        }
        for item in followers {
            let rows = embedded.get(&item.cache_key).cloned().unwrap_or_default();
            ready.push((item, rows));
        }
        for (item, rows) in &ready {
            self.write_partition(tag, item, rows)?;
        }
        debug!(tag = %tag, items = items.len(), "embedded batch");
        Ok(())
    }

    fn add_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        let rows = {
            let conn = self.store.conn()?;
            self.mirror_rows(&conn, &item.cache_key)?
        };
        self.write_partition(tag, item, &rows)
    }

    fn remove_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        let vectors = self.vectors()?;
        let name = partition_name(tag);
        if vectors.has_partition(&name)? {
            vectors.delete(&name, &item.cache_key, Some(&item.path))?;
        }
        Ok(())
    }

    fn delete(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        self.remove_tag(tag, item)?;
        self.store.conn()?.execute(
            "DELETE FROM vector_cache WHERE cache_key = ?1 AND artifact_id = ?2",
            params![item.cache_key, self.artifact_id()],
        )?;
        Ok(())
    }

    fn clear(&self) -> crate::Result<()> {
        if let Ok(vectors) = &self.vectors {
            vectors.clear()?;
        }
        self.store.conn()?.execute(
            "DELETE FROM vector_cache WHERE artifact_id = ?1",
            params![self.artifact_id()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::embed::EmbedError;
    use crate::vector_store::MemoryVectorStore;
    use crate::workspace::LastModifiedMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
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

    /// Embeds text as [len, count of 'a', 1.0]; fails when `fail` is set.
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        fail: bool,
        drop_last: bool,
    }

    impl Embedder for CountingEmbedder {
        fn id(&self) -> &str {
            "counting"
        }
        fn max_chunk_tokens(&self) -> usize {
            256
        }
        fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbedError::new("provider down"));
            }
            let mut out: Vec<Option<Vec<f32>>> = texts
                .iter()
                .map(|t| Some(vec![t.len() as f32, t.matches('a').count() as f32, 1.0]))
                .collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    fn index_with(
        files: &[(&str, &str)],
        embedder: Arc<CountingEmbedder>,
        status: VectorStoreStatus,
    ) -> (TempDir, VectorIndex) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let workspace = Arc::new(Files(
            files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
        ));
        let index = VectorIndex::new(
            store,
            workspace,
            embedder,
            status,
            ChunkPolicy::from_config(&IndexingConfig::default()),
            VectorConfig::default(),
        )
        .unwrap();
        (dir, index)
    }

    fn memory() -> VectorStoreStatus {
        VectorStoreStatus::Ready(Arc::new(MemoryVectorStore::new()))
    }

    #[test]
    fn test_compute_then_retrieve() {
        let embedder = Arc::new(CountingEmbedder::default());
        let (_dir, index) = index_with(
            &[("/r/a.py", "aaaa = 1\n"), ("/r/b.py", "bbbbbbbbbbbbbbbbbbbb = 2\n")],
            embedder.clone(),
            memory(),
        );
        let tag = IndexTag::new("/r", "main", index.artifact_id());
        index.begin(&tag).unwrap();
        index
            .compute(
                &tag,
                &[PathAndCacheKey::new("/r/a.py", "ka"), PathAndCacheKey::new("/r/b.py", "kb")],
            )
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        // query embeds as [4, 4, 1], matching a.py's chunk.
        let hits = index.retrieve("aaaa", 1, &[tag.branch_and_dir()], None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filepath, "/r/a.py");
        assert!(hits[0].content.starts_with("aaaa = 1"));
    }

    #[test]
    fn test_add_tag_reuses_mirror_without_embedding() {
        let embedder = Arc::new(CountingEmbedder::default());
        let (_dir, index) = index_with(&[("/r/a.py", "x = 1\n")], embedder.clone(), memory());
        let main = IndexTag::new("/r", "main", index.artifact_id());
        let dev = IndexTag::new("/r", "dev", index.artifact_id());
        let item = PathAndCacheKey::new("/r/a.py", "k");
        index.compute(&main, std::slice::from_ref(&item)).unwrap();
        index.add_tag(&dev, &item).unwrap();
        // compute for a known key also reuses the mirror
        index.compute(&dev, &[PathAndCacheKey::new("/r/copy.py", "k")]).unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let mut hits = index
            .retrieve("x = 1\n", 5, &[dev.branch_and_dir()], None)
            .unwrap();
        hits.sort_by(|a, b| a.filepath.cmp(&b.filepath));
        let paths: Vec<&str> = hits.iter().map(|h| h.filepath.as_str()).collect();
        assert_eq!(paths, vec!["/r/a.py", "/r/copy.py"]);
    }

    #[test]
    fn test_path_filter_and_delete() {
        let embedder = Arc::new(CountingEmbedder::default());
        let (_dir, index) = index_with(
            &[("/r/src/a.py", "a = 1\n"), ("/r/lib/b.py", "a = 1\n")],
            embedder,
            memory(),
        );
        let tag = IndexTag::new("/r", "main", index.artifact_id());
        let a = PathAndCacheKey::new("/r/src/a.py", "ka");
        let b = PathAndCacheKey::new("/r/lib/b.py", "kb");
        index.compute(&tag, &[a.clone(), b]).unwrap();

        let hits = index
            .retrieve("a = 1\n", 5, &[tag.branch_and_dir()], Some("/r/lib"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filepath, "/r/lib/b.py");

        index.delete(&tag, &a).unwrap();
        let hits = index.retrieve("a = 1\n", 5, &[tag.branch_and_dir()], None).unwrap();
        assert_eq!(hits.len(), 1);
        let conn = index.store.conn().unwrap();
        assert!(index.mirror_rows(&conn, "ka").unwrap().is_empty());
    }

    #[test]
    fn test_provider_error_is_wrapped() {
        let embedder = Arc::new(CountingEmbedder {
            fail: true,
            ..Default::default()
        });
        let (_dir, index) = index_with(&[("/r/a.py", "x = 1\n")], embedder, memory());
        let tag = IndexTag::new("/r", "main", index.artifact_id());
        let err = index
            .compute(&tag, &[PathAndCacheKey::new("/r/a.py", "k")])
            .unwrap_err();
        assert!(matches!(err, StrataError::Embedding { chunks: 1, .. }));
        assert!(err.is_fatal_for_pass());
    }

    #[test]
    fn test_short_embedding_result_drops_tail() {
        let embedder = Arc::new(CountingEmbedder {
            drop_last: true,
            ..Default::default()
        });
        let (_dir, index) = index_with(
            &[("/r/a.py", "x = 1\n"), ("/r/b.py", "y = 2\n")],
            embedder,
            memory(),
        );
        let tag = IndexTag::new("/r", "main", index.artifact_id());
        index
            .compute(
                &tag,
                &[PathAndCacheKey::new("/r/a.py", "ka"), PathAndCacheKey::new("/r/b.py", "kb")],
            )
            .unwrap();
        let conn = index.store.conn().unwrap();
        assert_eq!(index.mirror_rows(&conn, "ka").unwrap().len(), 1);
        assert!(index.mirror_rows(&conn, "kb").unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_backend_fails_begin() {
        let (_dir, index) = index_with(
            &[],
            Arc::new(CountingEmbedder::default()),
            VectorStoreStatus::Unsupported {
                backend: "lancedb".to_string(),
                reason: "not built".to_string(),
            },
        );
        let tag = IndexTag::new("/r", "main", index.artifact_id());
        let err = index.begin(&tag).unwrap_err();
        assert!(matches!(err, StrataError::StoreUnavailable { .. }));
        assert!(err.is_fatal_for_pass());
    }
}
