//! Classify a tag's current files against its catalog.

use super::catalog::{self, now_ms, CatalogRow, TagCommitter};
use super::{global_cache, RefreshIndexResults};
use crate::error::StrataError;
use crate::hash::{content_key, HashMemo};
use crate::store::Store;
use crate::tag::{IndexTag, PathAndCacheKey};
use crate::workspace::{LastModifiedMap, Workspace};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hashes file contents on a bounded pool of readers.
pub struct ContentHasher {
    workspace: Arc<dyn Workspace>,
    pool: rayon::ThreadPool,
}

impl ContentHasher {
    pub fn new(workspace: Arc<dyn Workspace>, max_concurrent_reads: usize) -> crate::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrent_reads.max(1))
            .thread_name(|i| format!("strata-hash-{i}"))
            .build()
            .map_err(|e| StrataError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self { workspace, pool })
    }

    /// Digest for each readable path. Unreadable files are left out.
    pub fn hash_many(&self, files: &[(String, i64)], memo: &HashMemo) -> HashMap<String, String> {
        self.pool.install(|| {
            files
                .par_iter()
                .filter_map(|(path, mtime)| {
                    if let Some(key) = memo.get(path, *mtime) {
                        return Some((path.clone(), key));
                    }
                    match self.workspace.read_file(path) {
                        Ok(bytes) => {
                            let key = content_key(&bytes);
                            memo.insert(path, *mtime, key.clone());
                            Some((path.clone(), key))
                        }
                        Err(e) => {
                            warn!(path, error = %e, "unreadable file skipped");
                            None
                        }
                    }
                })
                .collect()
        })
    }
}

/// Everything a refresh needs to run and commit one tag.
pub struct DiffOutcome {
    pub results: RefreshIndexResults,
    /// Unchanged content; only catalog timestamps move.
    pub stale: Vec<PathAndCacheKey>,
    /// Removals with no membership rows. Indexes never see these; the
    /// catalog row is dropped on commit.
    pub inconsistent: Vec<PathAndCacheKey>,
    pub committer: Arc<TagCommitter>,
}

pub fn diff(
    store: &Arc<Store>,
    tag: &IndexTag,
    current_files: &LastModifiedMap,
    hasher: &ContentHasher,
    memo: &HashMemo,
) -> crate::Result<DiffOutcome> {
    diff_paths(store, tag, current_files, hasher, memo, None)
}

/// Same as [`diff`], restricted to `only` when given. Paths in `only` that
/// are missing from `current_files` count as deleted.
pub fn diff_paths(
    store: &Arc<Store>,
    tag: &IndexTag,
    current_files: &LastModifiedMap,
    hasher: &ContentHasher,
    memo: &HashMemo,
    only: Option<&HashSet<String>>,
) -> crate::Result<DiffOutcome> {
    let pass_started = now_ms();
    let wanted = |path: &str| only.map_or(true, |set| set.contains(path));

    let rows: Vec<CatalogRow> = {
        let conn = store.conn()?;
        catalog::load_rows(&conn, tag)?
    };
    let rows: Vec<CatalogRow> = rows.into_iter().filter(|r| wanted(&r.path)).collect();
    let cataloged: HashSet<&str> = rows.iter().map(|r| r.path.as_str()).collect();

    let mut stale = Vec::new();
    let mut removals: Vec<PathAndCacheKey> = Vec::new();
    let mut gone: HashSet<PathAndCacheKey> = HashSet::new();
    let mut touched: Vec<&CatalogRow> = Vec::new();

    for row in &rows {
        let item = PathAndCacheKey::new(&row.path, &row.cache_key);
        match current_files.get(&row.path) {
            None => {
                gone.insert(item.clone());
                removals.push(item);
            }
            Some(&mtime) if mtime <= row.last_updated => stale.push(item),
            Some(_) => touched.push(row),
        }
    }

    let mut new_files: Vec<(String, i64)> = current_files
        .iter()
        .filter(|(path, _)| wanted(path) && !cataloged.contains(path.as_str()))
        .map(|(path, mtime)| (path.clone(), *mtime))
        .collect();
    new_files.sort();
    let to_hash: Vec<(String, i64)> = touched
        .iter()
        .filter_map(|row| current_files.get(&row.path).map(|m| (row.path.clone(), *m)))
        .chain(new_files.iter().cloned())
        .collect();
    let digests = hasher.hash_many(&to_hash, memo);

    let mut additions: Vec<PathAndCacheKey> = Vec::new();
    for row in touched {
        match digests.get(&row.path) {
            Some(key) if *key == row.cache_key => {
                stale.push(PathAndCacheKey::new(&row.path, &row.cache_key))
            }
            Some(key) => {
                removals.push(PathAndCacheKey::new(&row.path, &row.cache_key));
                additions.push(PathAndCacheKey::new(&row.path, key));
            }
            None => debug!(path = %row.path, "touched file unreadable, keeping catalog row"),
        }
    }
    for (path, _) in &new_files {
        if let Some(key) = digests.get(path) {
            additions.push(PathAndCacheKey::new(path, key));
        }
    }
    additions.sort();
    removals.sort();

    let mut results = RefreshIndexResults::default();
    let mut inconsistent = Vec::new();
    {
        let conn = store.conn()?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut count_of = |key: &str| -> crate::Result<usize> {
            if let Some(n) = counts.get(key) {
                return Ok(*n);
            }
            let n = global_cache::reference_count(&conn, key, &tag.artifact_id)?;
            counts.insert(key.to_string(), n);
            Ok(n)
        };

        let mut pending_adds: HashMap<String, usize> = HashMap::new();
        for item in additions {
            // Two new paths with the same content in one pass both compute;
            // compute links to existing artifacts when they are already there.
            if count_of(&item.cache_key)? > 0 {
                results.add_tag.push(item.clone());
            } else {
                results.compute.push(item.clone());
            }
            *pending_adds.entry(item.cache_key).or_default() += 1;
        }

        let mut remaining: HashMap<String, usize> = HashMap::new();
        for item in removals {
            let left = match remaining.get(&item.cache_key) {
                Some(n) => *n,
                None => {
                    count_of(&item.cache_key)?
                        + pending_adds.get(&item.cache_key).copied().unwrap_or(0)
                }
            };
            match left {
                0 => {
                    warn!(
                        tag = %tag,
                        path = %item.path,
                        cache_key = %item.cache_key,
                        "catalog row with no membership, skipping artifact removal"
                    );
                    inconsistent.push(item);
                    continue;
                }
                1 => results.del.push(item.clone()),
                _ => results.remove_tag.push(item.clone()),
            }
            remaining.insert(item.cache_key, left - 1);
        }
    }

    debug!(
        tag = %tag,
        compute = results.compute.len(),
        add_tag = results.add_tag.len(),
        remove_tag = results.remove_tag.len(),
        del = results.del.len(),
        stale = stale.len(),
        "diff"
    );

    let mtimes: HashMap<String, i64> = current_files
        .iter()
        .filter(|(path, _)| wanted(path))
        .map(|(path, mtime)| (path.clone(), *mtime))
        .collect();
    let committer = Arc::new(TagCommitter::new(
        store.clone(),
        tag.clone(),
        pass_started,
        mtimes,
        gone,
    ));

    Ok(DiffOutcome {
        results,
        stale,
        inconsistent,
        committer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexResultType, MarkComplete};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Files(Mutex<HashMap<String, Vec<u8>>>);

    impl Workspace for Files {
        fn list_files(&self, _root: &Path) -> crate::Result<LastModifiedMap> {
            Ok(LastModifiedMap::new())
        }
        fn read_file(&self, path: &str) -> crate::Result<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
        }
        fn current_branch(&self, _root: &Path) -> String {
            "main".to_string()
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<Store>,
        files: Arc<Files>,
        hasher: ContentHasher,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Store::open(dir.path()).unwrap();
            let files = Arc::new(Files::default());
            let hasher = ContentHasher::new(files.clone(), 2).unwrap();
            Self {
                _dir: dir,
                store,
                files,
                hasher,
            }
        }

        fn write(&self, path: &str, content: &str) {
            self.files
                .0
                .lock()
                .unwrap()
                .insert(path.to_string(), content.as_bytes().to_vec());
        }

        fn remove(&self, path: &str) {
            self.files.0.lock().unwrap().remove(path);
        }

        fn diff(&self, tag: &IndexTag, files: &[(&str, i64)]) -> DiffOutcome {
            let current: LastModifiedMap =
                files.iter().map(|(p, m)| (p.to_string(), *m)).collect();
            diff(&self.store, tag, &current, &self.hasher, &HashMemo::new()).unwrap()
        }

        /// Commit every bucket as an index would.
        fn apply(&self, outcome: &DiffOutcome) {
            let c = &outcome.committer;
            c.mark_complete(&outcome.results.compute, IndexResultType::Compute).unwrap();
            c.mark_complete(&outcome.results.add_tag, IndexResultType::AddTag).unwrap();
            c.mark_complete(&outcome.results.remove_tag, IndexResultType::RemoveTag).unwrap();
            c.mark_complete(&outcome.results.del, IndexResultType::Delete).unwrap();
            c.mark_complete(&outcome.stale, IndexResultType::UpdateLastUpdated).unwrap();
            c.mark_complete(&outcome.inconsistent, IndexResultType::Inconsistent).unwrap();
        }
    }

    fn paths(items: &[PathAndCacheKey]) -> Vec<&str> {
        items.iter().map(|i| i.path.as_str()).collect()
    }

    #[test]
    fn test_new_files_compute_then_nothing_to_do() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "a");
        fx.write("/r/b.py", "b");

        let first = fx.diff(&tag, &[("/r/a.py", 1), ("/r/b.py", 1)]);
        assert_eq!(paths(&first.results.compute), vec!["/r/a.py", "/r/b.py"]);
        assert_eq!(first.results.compute[0].cache_key, content_key(b"a"));
        fx.apply(&first);

        let second = fx.diff(&tag, &[("/r/a.py", 1), ("/r/b.py", 1)]);
        assert!(second.results.is_empty());
        assert_eq!(second.stale.len(), 2);
    }

    #[test]
    fn test_modified_file_replaces_key() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "v1");
        fx.apply(&fx.diff(&tag, &[("/r/a.py", 1)]));

        fx.write("/r/a.py", "v2");
        let outcome = fx.diff(&tag, &[("/r/a.py", i64::MAX)]);
        assert_eq!(outcome.results.compute.len(), 1);
        assert_eq!(outcome.results.compute[0].cache_key, content_key(b"v2"));
        assert_eq!(outcome.results.del.len(), 1);
        assert_eq!(outcome.results.del[0].cache_key, content_key(b"v1"));
    }

    #[test]
    fn test_touch_without_change_is_stale() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "same");
        fx.apply(&fx.diff(&tag, &[("/r/a.py", 1)]));

        let outcome = fx.diff(&tag, &[("/r/a.py", i64::MAX)]);
        assert!(outcome.results.is_empty());
        assert_eq!(paths(&outcome.stale), vec!["/r/a.py"]);
    }

    #[test]
    fn test_other_branch_adds_tag_without_compute() {
        let fx = Fixture::new();
        let main = IndexTag::new("/r", "main", "chunks");
        let dev = IndexTag::new("/r", "dev", "chunks");
        fx.write("/r/a.py", "shared");
        fx.apply(&fx.diff(&main, &[("/r/a.py", 1)]));

        let outcome = fx.diff(&dev, &[("/r/a.py", 1)]);
        assert!(outcome.results.compute.is_empty());
        assert_eq!(paths(&outcome.results.add_tag), vec!["/r/a.py"]);
    }

    #[test]
    fn test_delete_shared_content_removes_tag_only() {
        let fx = Fixture::new();
        let main = IndexTag::new("/r", "main", "chunks");
        let dev = IndexTag::new("/r", "dev", "chunks");
        fx.write("/r/a.py", "shared");
        fx.apply(&fx.diff(&main, &[("/r/a.py", 1)]));
        fx.apply(&fx.diff(&dev, &[("/r/a.py", 1)]));

        fx.remove("/r/a.py");
        let on_dev = fx.diff(&dev, &[]);
        assert_eq!(paths(&on_dev.results.remove_tag), vec!["/r/a.py"]);
        assert!(on_dev.results.del.is_empty());
        fx.apply(&on_dev);

        let on_main = fx.diff(&main, &[]);
        assert_eq!(paths(&on_main.results.del), vec!["/r/a.py"]);
    }

    #[test]
    fn test_rename_keeps_artifacts() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/old.py", "body");
        fx.apply(&fx.diff(&tag, &[("/r/old.py", 1)]));

        fx.remove("/r/old.py");
        fx.write("/r/new.py", "body");
        let outcome = fx.diff(&tag, &[("/r/new.py", 2)]);
        assert_eq!(paths(&outcome.results.add_tag), vec!["/r/new.py"]);
        assert_eq!(paths(&outcome.results.remove_tag), vec!["/r/old.py"]);
        assert!(outcome.results.del.is_empty());
        assert!(outcome.results.compute.is_empty());
    }

    #[test]
    fn test_duplicate_content_deleted_together() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "dup");
        fx.write("/r/b.py", "dup");
        let first = fx.diff(&tag, &[("/r/a.py", 1), ("/r/b.py", 1)]);
        assert_eq!(first.results.compute.len(), 2);
        fx.apply(&first);

        let outcome = fx.diff(&tag, &[]);
        assert_eq!(paths(&outcome.results.remove_tag), vec!["/r/a.py"]);
        assert_eq!(paths(&outcome.results.del), vec!["/r/b.py"]);
    }

    #[test]
    fn test_missing_membership_is_reported_not_deleted() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "x");
        fx.apply(&fx.diff(&tag, &[("/r/a.py", 1)]));
        fx.store
            .conn()
            .unwrap()
            .execute("DELETE FROM global_cache", [])
            .unwrap();

        let outcome = fx.diff(&tag, &[]);
        assert!(outcome.results.is_empty());
        assert_eq!(paths(&outcome.inconsistent), vec!["/r/a.py"]);
        fx.apply(&outcome);

        // Catalog row repaired; nothing left to reconcile.
        let again = fx.diff(&tag, &[]);
        assert!(again.inconsistent.is_empty());
        assert!(again.results.is_empty());
    }

    #[test]
    fn test_restricted_diff_ignores_other_paths() {
        let fx = Fixture::new();
        let tag = IndexTag::new("/r", "main", "chunks");
        fx.write("/r/a.py", "a");
        fx.write("/r/b.py", "b");
        fx.apply(&fx.diff(&tag, &[("/r/a.py", 1), ("/r/b.py", 1)]));

        fx.write("/r/c.py", "c");
        let current: LastModifiedMap = [("/r/c.py".to_string(), 1)].into_iter().collect();
        let only: HashSet<String> = ["/r/c.py".to_string()].into_iter().collect();
        let outcome =
            diff_paths(&fx.store, &tag, &current, &fx.hasher, &HashMemo::new(), Some(&only))
                .unwrap();
        assert_eq!(paths(&outcome.results.compute), vec!["/r/c.py"]);
        assert!(outcome.results.del.is_empty());
        assert!(outcome.stale.is_empty());
    }

    #[test]
    fn test_memo_hashes_once_per_pass() {
        let fx = Fixture::new();
        let memo = HashMemo::new();
        fx.write("/r/a.py", "a");
        let files = vec![("/r/a.py".to_string(), 7)];
        fx.hasher.hash_many(&files, &memo);
        fx.remove("/r/a.py");
        let again = fx.hasher.hash_many(&files, &memo);
        assert_eq!(again.get("/r/a.py"), Some(&content_key(b"a")));
        assert_eq!(memo.len(), 1);
    }
}
