//! Full-text search over chunks with SQLite FTS5.

use super::chunks::{self, CHUNKS_ARTIFACT_ID};
use super::global_cache;
use super::{Chunk, CodebaseIndex};
use crate::config::LexicalConfig;
use crate::error::StrataError;
use crate::store::Store;
use crate::tag::{BranchAndDir, IndexTag, PathAndCacheKey};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

pub const LEXICAL_ARTIFACT_ID: &str = "sqliteFts";

const TOKENIZERS: &[&str] = &["trigram", "unicode61", "porter unicode61", "ascii"];

pub struct LexicalIndex {
    store: Arc<Store>,
    config: LexicalConfig,
}

impl LexicalIndex {
    pub fn new(store: Arc<Store>, config: LexicalConfig) -> crate::Result<Self> {
        if !TOKENIZERS.contains(&config.tokenizer.as_str()) {
            return Err(StrataError::ConfigParse(format!(
                "unknown FTS5 tokenizer '{}'",
                config.tokenizer
            )));
        }
        {
            let conn = store.conn()?;
            chunks::create_tables(&conn)?;
            conn.execute_batch(&format!(
                "
                CREATE VIRTUAL TABLE IF NOT EXISTS fts USING fts5(
                    path,
                    content,
                    tokenize = '{}'
                );

                CREATE TABLE IF NOT EXISTS fts_metadata (
                    id INTEGER PRIMARY KEY,
                    cache_key TEXT NOT NULL,
                    path TEXT NOT NULL,
                    chunk_idx INTEGER NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL,
                    UNIQUE (cache_key, chunk_idx)
                );

                CREATE TABLE IF NOT EXISTS fts_tags (
                    id INTEGER PRIMARY KEY,
                    cache_key TEXT NOT NULL,
                    tag TEXT NOT NULL,
                    path TEXT NOT NULL,
                    UNIQUE (cache_key, tag, path)
                );
                CREATE INDEX IF NOT EXISTS idx_fts_tags_tag ON fts_tags(tag);
                ",
                config.tokenizer
            ))?;
        }
        Ok(Self { store, config })
    }

    /// Best matches for `query` across `tags`, ranked by BM25 with path
    /// matches weighted up. Empty when the query has no usable terms.
    pub fn retrieve(
        &self,
        tags: &[BranchAndDir],
        query: &str,
        n: usize,
        path_filter: Option<&str>,
    ) -> crate::Result<Vec<Chunk>> {
        let trigram = self.config.tokenizer == "trigram";
        let Some(expression) = match_expression(query, trigram) else {
            return Ok(Vec::new());
        };
        if tags.is_empty() || n == 0 {
            return Ok(Vec::new());
        }

        let tag_strings: Vec<String> = tags
            .iter()
            .map(|t| t.with_artifact(LEXICAL_ARTIFACT_ID).tag_string())
            .collect();
        let placeholders = vec!["?"; tag_strings.len()].join(", ");
        let path_clause = if path_filter.is_some() {
            "AND substr(t.path, 1, length(?)) = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT DISTINCT m.cache_key, t.path, m.chunk_idx, m.start_line, m.end_line,
                    fts.content, bm25(fts, {weight:.4}, 1.0) AS rank
             FROM fts
             JOIN fts_metadata m ON fts.rowid = m.id
             JOIN fts_tags t ON t.cache_key = m.cache_key
             WHERE fts MATCH ? AND t.tag IN ({placeholders}) {path_clause}
             ORDER BY rank
             LIMIT ?",
            weight = self.config.path_weight,
        );

        let mut values: Vec<Value> = vec![Value::Text(expression)];
        values.extend(tag_strings.into_iter().map(Value::Text));
        if let Some(prefix) = path_filter {
            values.push(Value::Text(prefix.to_string()));
            values.push(Value::Text(prefix.to_string()));
        }
        values.push(Value::Integer(n as i64));

        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((
                    Chunk {
                        cache_key: row.get(0)?,
                        filepath: row.get(1)?,
                        index: row.get::<_, i64>(2)? as usize,
                        start_line: row.get::<_, i64>(3)? as usize,
                        end_line: row.get::<_, i64>(4)? as usize,
                        content: row.get(5)?,
                    },
                    row.get::<_, f64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let threshold = self.config.bm25_threshold;
        let total = rows.len();
        let kept: Vec<Chunk> = rows
            .into_iter()
            .filter(|(_, rank)| *rank <= threshold)
            .map(|(chunk, _)| chunk)
            .collect();
        debug!(matched = total, kept = kept.len(), threshold, "lexical retrieve");
        Ok(kept)
    }
}

/// The whole query as a phrase, OR'ed with each of its terms.
fn match_expression(query: &str, trigram: bool) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        // trigram cannot match anything shorter than three characters
        .filter(|t| !t.is_empty() && (!trigram || t.chars().count() >= 3))
        .collect();
    if terms.is_empty() {
        return None;
    }

    let mut parts = Vec::with_capacity(terms.len() + 1);
    if terms.len() > 1 {
        parts.push(format!("\"{}\"", terms.join(" ")));
    }
    parts.extend(terms.iter().map(|t| format!("\"{t}\"")));
    Some(parts.join(" OR "))
}

fn is_indexed(conn: &Connection, cache_key: &str) -> crate::Result<bool> {
    let found: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM fts_metadata WHERE cache_key = ?1 LIMIT 1")?
        .query_row(params![cache_key], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn link(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO fts_tags (cache_key, tag, path) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

fn unlink(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached("DELETE FROM fts_tags WHERE cache_key = ?1 AND tag = ?2 AND path = ?3")?
        .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

impl CodebaseIndex for LexicalIndex {
    fn artifact_id(&self) -> String {
        LEXICAL_ARTIFACT_ID.to_string()
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()> {
        let mut conn = self.store.conn()?;
        for item in items {
            let tx = conn.transaction()?;
            if !is_indexed(&tx, &item.cache_key)? {
                let rows = chunks::chunks_for(&tx, &item.cache_key)?;
                // content with no chunks is fine only once the chunk index has recorded it
                if rows.is_empty()
                    && global_cache::reference_count(&tx, &item.cache_key, CHUNKS_ARTIFACT_ID)? == 0
                {
                    return Err(StrataError::MissingArtifact {
                        artifact: CHUNKS_ARTIFACT_ID,
                        cache_key: item.cache_key.clone(),
                    });
                }
                for chunk in &rows {
                    tx.prepare_cached("INSERT INTO fts (path, content) VALUES (?1, ?2)")?
                        .execute(params![item.path, chunk.content])?;
                    let rowid = tx.last_insert_rowid();
                    tx.prepare_cached(
                        "INSERT INTO fts_metadata (id, cache_key, path, chunk_idx, start_line, end_line)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?
                    .execute(params![
                        rowid,
                        item.cache_key,
                        item.path,
                        chunk.index as i64,
                        chunk.start_line as i64,
                        chunk.end_line as i64,
                    ])?;
                }
                debug!(path = %item.path, chunks = rows.len(), "fts indexed");
            }
            link(&tx, tag, item)?;
            tx.commit()?;
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
        let still_linked: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM fts_tags WHERE cache_key = ?1 LIMIT 1",
                params![item.cache_key],
                |row| row.get(0),
            )
            .optional()?;
        if still_linked.is_none() {
            tx.execute(
                "DELETE FROM fts WHERE rowid IN (SELECT id FROM fts_metadata WHERE cache_key = ?1)",
                params![item.cache_key],
            )?;
            tx.execute(
                "DELETE FROM fts_metadata WHERE cache_key = ?1",
                params![item.cache_key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> crate::Result<()> {
        self.store
            .conn()?
            .execute_batch("DELETE FROM fts; DELETE FROM fts_metadata; DELETE FROM fts_tags;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(threshold: f64) -> (TempDir, Arc<Store>, LexicalIndex) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = LexicalConfig {
            bm25_threshold: threshold,
            ..LexicalConfig::default()
        };
        let index = LexicalIndex::new(store.clone(), config).unwrap();
        (dir, store, index)
    }

    fn seed_chunk(store: &Store, key: &str, path: &str, content: &str) {
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO chunks (cache_key, path, idx, start_line, end_line, content)
                 VALUES (?1, ?2, 0, 1, 3, ?3)",
                params![key, path, content],
            )
            .unwrap();
    }

    fn corpus(store: &Store, index: &LexicalIndex, tag: &IndexTag) {
        let files = [
            ("k1", "/r/src/widget.rs", "fn build_widget_factory() { make widget parts }"),
            ("k2", "/r/src/parser.rs", "fn parse_tokens(input: &str) { lexer tokens }"),
            ("k3", "/r/docs/notes.md", "meeting notes about deployment schedules"),
            ("k4", "/r/src/cache.rs", "struct LruCache { entries: Vec<u8> }"),
            ("k5", "/r/src/net.rs", "async fn connect(addr: SocketAddr) { socket }"),
        ];
        for (key, path, content) in files {
            seed_chunk(store, key, path, content);
            index.compute(tag, &[PathAndCacheKey::new(path, key)]).unwrap();
        }
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(
            match_expression("widget factory", true).as_deref(),
            Some("\"widget factory\" OR \"widget\" OR \"factory\"")
        );
        assert_eq!(match_expression("a bc", true), None);
        assert_eq!(match_expression("a", false).as_deref(), Some("\"a\""));
        assert_eq!(match_expression("say \"hi\"", false).as_deref(), Some("\"say hi\" OR \"say\" OR \"hi\""));
    }

    #[test]
    fn test_retrieve_ranks_matching_chunk() {
        let (_dir, store, index) = setup(0.0);
        let tag = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        corpus(&store, &index, &tag);

        let results = index
            .retrieve(&[tag.branch_and_dir()], "widget factory", 5, None)
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].filepath, "/r/src/widget.rs");
        assert_eq!(results[0].start_line, 1);
        assert!(results.iter().all(|c| c.filepath != "/r/docs/notes.md"));
    }

    #[test]
    fn test_phrase_ranks_contiguous_above_scattered() {
        let (_dir, store, index) = setup(0.0);
        let tag = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        let files = [
            ("k1", "/r/scattered.txt", "the connection was slow and the pool filled up"),
            ("k2", "/r/contig.txt", "the connection pool filled up while it was slow"),
            ("k3", "/r/a.txt", "release notes for the winter build"),
            ("k4", "/r/b.txt", "rendering shaders on mobile hardware"),
            ("k5", "/r/c.txt", "quarterly budget review minutes"),
            ("k6", "/r/d.txt", "garden irrigation schedule for march"),
        ];
        for (key, path, content) in files {
            seed_chunk(&store, key, path, content);
            index.compute(&tag, &[PathAndCacheKey::new(path, key)]).unwrap();
        }

        let paths: Vec<String> = index
            .retrieve(&[tag.branch_and_dir()], "connection pool", 5, None)
            .unwrap()
            .into_iter()
            .map(|c| c.filepath)
            .collect();
        assert_eq!(paths, vec!["/r/contig.txt", "/r/scattered.txt"]);
    }

    #[test]
    fn test_compute_without_chunks_fails_and_links_nothing() {
        let (_dir, store, index) = setup(0.0);
        let tag = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        let item = PathAndCacheKey::new("/r/missing.rs", "k9");

        let err = index.compute(&tag, &[item.clone()]).unwrap_err();
        assert!(matches!(err, StrataError::MissingArtifact { artifact: CHUNKS_ARTIFACT_ID, .. }));
        let links: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fts_tags WHERE cache_key = 'k9'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(links, 0);

        // once the chunk index owns the key, an empty file links normally
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO global_cache (cache_key, artifact_id, dir, branch, path)
                 VALUES ('k9', ?1, '/r', 'main', '/r/missing.rs')",
                params![CHUNKS_ARTIFACT_ID],
            )
            .unwrap();
        index.compute(&tag, &[item]).unwrap();
        let links: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fts_tags WHERE cache_key = 'k9'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(links, 1);
    }

    #[test]
    fn test_threshold_excludes_weak_matches() {
        let (_dir, store, index) = setup(-1000.0);
        let tag = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        corpus(&store, &index, &tag);
        let results = index
            .retrieve(&[tag.branch_and_dir()], "widget factory", 5, None)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_path_filter_and_tag_scope() {
        let (_dir, store, index) = setup(0.0);
        let tag = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        corpus(&store, &index, &tag);

        let in_docs = index
            .retrieve(&[tag.branch_and_dir()], "widget", 5, Some("/r/docs"))
            .unwrap();
        assert!(in_docs.is_empty());

        let other_branch = BranchAndDir::new("/r", "dev");
        assert!(index.retrieve(&[other_branch], "widget", 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_rows_after_last_link() {
        let (_dir, store, index) = setup(0.0);
        let main = IndexTag::new("/r", "main", LEXICAL_ARTIFACT_ID);
        let dev = IndexTag::new("/r", "dev", LEXICAL_ARTIFACT_ID);
        corpus(&store, &index, &main);
        let item = PathAndCacheKey::new("/r/src/widget.rs", "k1");
        index.add_tag(&dev, &item).unwrap();

        index.delete(&main, &item).unwrap();
        let on_dev = index
            .retrieve(&[dev.branch_and_dir()], "widget factory", 5, None)
            .unwrap();
        assert_eq!(on_dev.len(), 1);

        index.delete(&dev, &item).unwrap();
        let count: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fts_metadata WHERE cache_key = 'k1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unknown_tokenizer_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = LexicalConfig {
            tokenizer: "icu".to_string(),
            ..LexicalConfig::default()
        };
        assert!(matches!(
            LexicalIndex::new(store, config),
            Err(StrataError::ConfigParse(_))
        ));
    }
}
