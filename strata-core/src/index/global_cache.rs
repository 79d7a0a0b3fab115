//! Content membership: which (tag, path) pairs reference each cache key.

use super::{CodebaseIndex, IndexResultType};
use crate::store::Store;
use crate::tag::{IndexTag, PathAndCacheKey};
use rusqlite::{params, Connection};
use std::sync::Arc;

pub const GLOBAL_CACHE_ARTIFACT_ID: &str = "globalCache";

/// Number of (tag, path) references to `cache_key` for one artifact kind.
pub fn reference_count(
    conn: &Connection,
    cache_key: &str,
    artifact_id: &str,
) -> crate::Result<usize> {
    let count: i64 = conn
        .prepare_cached(
            "SELECT COUNT(*) FROM global_cache WHERE cache_key = ?1 AND artifact_id = ?2",
        )?
        .query_row(params![cache_key, artifact_id], |row| row.get(0))?;
    Ok(count as usize)
}

/// Tags holding `cache_key` for one artifact kind.
pub fn tags_for(
    conn: &Connection,
    cache_key: &str,
    artifact_id: &str,
) -> crate::Result<Vec<IndexTag>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT dir, branch FROM global_cache
         WHERE cache_key = ?1 AND artifact_id = ?2 ORDER BY dir, branch",
    )?;
    let tags = stmt
        .query_map(params![cache_key, artifact_id], |row| {
            Ok(IndexTag::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                artifact_id,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// Membership maintenance as an index of its own. Every tag committer
/// replays its results through [`GlobalCacheIndex::record`] inside the
/// catalog transaction.
#[derive(Clone)]
pub struct GlobalCacheIndex {
    store: Arc<Store>,
}

impl GlobalCacheIndex {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Apply one result to the membership rows for `tag`. Runs inside the
    /// caller's transaction.
    pub fn record(
        &self,
        conn: &Connection,
        tag: &IndexTag,
        items: &[PathAndCacheKey],
        result: IndexResultType,
    ) -> crate::Result<()> {
        let sql = match result {
            IndexResultType::Compute | IndexResultType::AddTag => {
                "INSERT OR IGNORE INTO global_cache (cache_key, dir, branch, artifact_id, path)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            }
            IndexResultType::RemoveTag | IndexResultType::Delete => {
                "DELETE FROM global_cache
                 WHERE cache_key = ?1 AND dir = ?2 AND branch = ?3 AND artifact_id = ?4 AND path = ?5"
            }
            IndexResultType::UpdateLastUpdated | IndexResultType::Inconsistent => return Ok(()),
        };
        let mut stmt = conn.prepare_cached(sql)?;
        for item in items {
            stmt.execute(params![
                item.cache_key,
                tag.directory,
                tag.branch,
                tag.artifact_id,
                item.path
            ])?;
        }
        Ok(())
    }

    fn run(
        &self,
        tag: &IndexTag,
        items: &[PathAndCacheKey],
        result: IndexResultType,
    ) -> crate::Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        self.record(&tx, tag, items, result)?;
        tx.commit()?;
        Ok(())
    }
}

impl CodebaseIndex for GlobalCacheIndex {
    fn artifact_id(&self) -> String {
        GLOBAL_CACHE_ARTIFACT_ID.to_string()
    }

    fn compute_batch_size(&self) -> usize {
        usize::MAX
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()> {
        self.run(tag, items, IndexResultType::Compute)
    }

    fn add_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        self.run(tag, std::slice::from_ref(item), IndexResultType::AddTag)
    }

    fn remove_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        self.run(tag, std::slice::from_ref(item), IndexResultType::RemoveTag)
    }

    fn delete(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        self.run(tag, std::slice::from_ref(item), IndexResultType::Delete)
    }

    fn clear(&self) -> crate::Result<()> {
        self.store.conn()?.execute("DELETE FROM global_cache", [])?;
        Ok(())
    }
}
