//! The tag catalog: what each partition holds, and the committer that
//! advances it once an index has written an item.

use super::{GlobalCacheIndex, IndexResultType, MarkComplete};
use crate::store::Store;
use crate::tag::{IndexTag, PathAndCacheKey};
use rusqlite::{params, Connection, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// One `tag_catalog` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub path: String,
    pub cache_key: String,
    pub last_updated: i64,
}

pub fn load_rows(conn: &Connection, tag: &IndexTag) -> crate::Result<Vec<CatalogRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, cache_key, last_updated FROM tag_catalog
         WHERE dir = ?1 AND branch = ?2 AND artifact_id = ?3",
    )?;
    let rows = stmt
        .query_map(params![tag.directory, tag.branch, tag.artifact_id], |row| {
            Ok(CatalogRow {
                path: row.get(0)?,
                cache_key: row.get(1)?,
                last_updated: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Commits items of one tag for one pass.
///
/// Each `mark_complete` call writes catalog and membership rows for its
/// items in a single transaction.
pub struct TagCommitter {
    store: Arc<Store>,
    tag: IndexTag,
    pass_started: i64,
    /// New catalog timestamp per path: max(pass start, file mtime).
    mtimes: HashMap<String, i64>,
    /// Removals whose path left the tag; other removals are old versions of
    /// a path that stays.
    gone: HashSet<PathAndCacheKey>,
    membership: GlobalCacheIndex,
}

impl TagCommitter {
    pub fn new(
        store: Arc<Store>,
        tag: IndexTag,
        pass_started: i64,
        mtimes: HashMap<String, i64>,
        gone: HashSet<PathAndCacheKey>,
    ) -> Self {
        Self {
            membership: GlobalCacheIndex::new(store.clone()),
            store,
            tag,
            pass_started,
            mtimes,
            gone,
        }
    }

    pub fn tag(&self) -> &IndexTag {
        &self.tag
    }

    fn timestamp(&self, path: &str) -> i64 {
        self.mtimes
            .get(path)
            .copied()
            .unwrap_or(0)
            .max(self.pass_started)
    }

    fn upsert(&self, tx: &Transaction, item: &PathAndCacheKey) -> crate::Result<()> {
        tx.prepare_cached(
            "INSERT INTO tag_catalog (dir, branch, artifact_id, path, cache_key, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(dir, branch, artifact_id, path)
             DO UPDATE SET cache_key = excluded.cache_key, last_updated = excluded.last_updated",
        )?
        .execute(params![
            self.tag.directory,
            self.tag.branch,
            self.tag.artifact_id,
            item.path,
            item.cache_key,
            self.timestamp(&item.path),
        ])?;
        Ok(())
    }

    fn remove_row(&self, tx: &Transaction, item: &PathAndCacheKey) -> crate::Result<()> {
        // Only the row for this version: a newer version of the path may
        // already have been committed.
        tx.prepare_cached(
            "DELETE FROM tag_catalog
             WHERE dir = ?1 AND branch = ?2 AND artifact_id = ?3 AND path = ?4 AND cache_key = ?5",
        )?
        .execute(params![
            self.tag.directory,
            self.tag.branch,
            self.tag.artifact_id,
            item.path,
            item.cache_key,
        ])?;
        Ok(())
    }

    fn touch(&self, tx: &Transaction, item: &PathAndCacheKey) -> crate::Result<()> {
        tx.prepare_cached(
            "UPDATE tag_catalog SET last_updated = MAX(last_updated, ?1)
             WHERE dir = ?2 AND branch = ?3 AND artifact_id = ?4 AND path = ?5 AND cache_key = ?6",
        )?
        .execute(params![
            self.timestamp(&item.path),
            self.tag.directory,
            self.tag.branch,
            self.tag.artifact_id,
            item.path,
            item.cache_key,
        ])?;
        Ok(())
    }
}

impl MarkComplete for TagCommitter {
    fn mark_complete(
        &self,
        items: &[PathAndCacheKey],
        result: IndexResultType,
    ) -> crate::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        for item in items {
            match result {
                IndexResultType::Compute | IndexResultType::AddTag => self.upsert(&tx, item)?,
                IndexResultType::RemoveTag
                | IndexResultType::Delete
                | IndexResultType::Inconsistent => {
                    if self.gone.contains(item) {
                        self.remove_row(&tx, item)?;
                    }
                }
                IndexResultType::UpdateLastUpdated => self.touch(&tx, item)?,
            }
        }
        self.membership.record(&tx, &self.tag, items, result)?;
        tx.commit()?;
        debug!(tag = %self.tag, items = items.len(), ?result, "committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Store>, IndexTag) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store, IndexTag::new("/r", "main", "chunks"))
    }

    fn committer(
        store: &Arc<Store>,
        tag: &IndexTag,
        started: i64,
        mtimes: &[(&str, i64)],
        gone: &[PathAndCacheKey],
    ) -> TagCommitter {
        TagCommitter::new(
            store.clone(),
            tag.clone(),
            started,
            mtimes.iter().map(|(p, m)| (p.to_string(), *m)).collect(),
            gone.iter().cloned().collect(),
        )
    }

    fn catalog_rows(store: &Store, tag: &IndexTag) -> Vec<CatalogRow> {
        let conn = store.conn().unwrap();
        let mut rows = load_rows(&conn, tag).unwrap();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    #[test]
    fn test_compute_upserts_with_max_timestamp() {
        let (_dir, store, tag) = setup();
        let c = committer(&store, &tag, 1_000, &[("/r/a.py", 5_000), ("/r/b.py", 10)], &[]);
        c.mark_complete(
            &[PathAndCacheKey::new("/r/a.py", "k1"), PathAndCacheKey::new("/r/b.py", "k2")],
            IndexResultType::Compute,
        )
        .unwrap();

        let rows = catalog_rows(&store, &tag);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].last_updated, 5_000);
        assert_eq!(rows[1].last_updated, 1_000);

        // A new version of the same path replaces the key.
        c.mark_complete(&[PathAndCacheKey::new("/r/a.py", "k3")], IndexResultType::Compute)
            .unwrap();
        let rows = catalog_rows(&store, &tag);
        assert_eq!(rows[0].cache_key, "k3");
    }

    #[test]
    fn test_old_version_removal_keeps_row_but_gone_path_deletes() {
        let (_dir, store, tag) = setup();
        let a_old = PathAndCacheKey::new("/r/a.py", "old");
        let a_new = PathAndCacheKey::new("/r/a.py", "new");
        let b = PathAndCacheKey::new("/r/b.py", "kb");

        let first = committer(&store, &tag, 1, &[], &[]);
        first
            .mark_complete(&[a_old.clone(), b.clone()], IndexResultType::Compute)
            .unwrap();

        let second = committer(&store, &tag, 2, &[], &[b.clone()]);
        second.mark_complete(&[a_new.clone()], IndexResultType::Compute).unwrap();
        second.mark_complete(&[a_old], IndexResultType::Delete).unwrap();
        second.mark_complete(&[b], IndexResultType::RemoveTag).unwrap();

        let rows = catalog_rows(&store, &tag);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cache_key, "new");
    }

    #[test]
    fn test_membership_written_in_same_commit() {
        let (_dir, store, tag) = setup();
        let item = PathAndCacheKey::new("/r/a.py", "k");
        let c = committer(&store, &tag, 1, &[], &[item.clone()]);
        c.mark_complete(&[item.clone()], IndexResultType::Compute).unwrap();
        {
            let conn = store.conn().unwrap();
            assert_eq!(crate::index::global_cache::reference_count(&conn, "k", "chunks").unwrap(), 1);
        }
        c.mark_complete(&[item], IndexResultType::Delete).unwrap();
        let conn = store.conn().unwrap();
        assert_eq!(crate::index::global_cache::reference_count(&conn, "k", "chunks").unwrap(), 0);
    }

    #[test]
    fn test_touch_only_moves_timestamp_forward() {
        let (_dir, store, tag) = setup();
        let item = PathAndCacheKey::new("/r/a.py", "k");
        committer(&store, &tag, 500, &[], &[])
            .mark_complete(&[item.clone()], IndexResultType::Compute)
            .unwrap();
        committer(&store, &tag, 100, &[], &[])
            .mark_complete(&[item.clone()], IndexResultType::UpdateLastUpdated)
            .unwrap();
        assert_eq!(catalog_rows(&store, &tag)[0].last_updated, 500);

        committer(&store, &tag, 900, &[], &[])
            .mark_complete(&[item], IndexResultType::UpdateLastUpdated)
            .unwrap();
        let rows = catalog_rows(&store, &tag);
        assert_eq!(rows[0].last_updated, 900);
        assert_eq!(rows[0].cache_key, "k");
    }
}
