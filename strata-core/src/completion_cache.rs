//! Bounded, persistent cache of autocomplete results keyed by typed prefix.

use crate::config::CompletionConfig;
use crate::error::StrataError;
use lru::LruCache;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

/// File name of the cache database inside its directory.
pub const COMPLETION_DB_FILE: &str = "autocompleteCache.sqlite";

pub struct CompletionCache {
    conn: Connection,
    entries: LruCache<String, String>,
    /// Last access per key, in strictly increasing milliseconds.
    stamps: HashMap<String, i64>,
    dirty: HashSet<String>,
    evicted: HashSet<String>,
    last_stamp: i64,
    flush_interval: Duration,
    last_flush: Instant,
}

impl CompletionCache {
    /// Open or create the cache at `path`, loading stored entries oldest
    /// first so recency carries over.
    pub fn open(path: &Path, config: &CompletionConfig) -> crate::Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
            StrataError::ConfigParse("completion.capacity must be at least 1".to_string())
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StrataError::StoreUnavailable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            ",
        )?;

        let rows: Vec<(String, String, i64)> = conn
            .prepare("SELECT key, value, timestamp FROM cache ORDER BY timestamp ASC")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut cache = Self {
            conn,
            entries: LruCache::new(capacity),
            stamps: HashMap::new(),
            dirty: HashSet::new(),
            evicted: HashSet::new(),
            last_stamp: 0,
            flush_interval: config.flush_interval_duration(),
            last_flush: Instant::now(),
        };
        for (key, value, timestamp) in rows {
            cache.last_stamp = cache.last_stamp.max(timestamp);
            cache.stamps.insert(key.clone(), timestamp);
            if let Some((old, _)) = cache.entries.push(key.clone(), value) {
                if old != key {
                    // loaded over capacity; the oldest rows go on next flush
                    cache.stamps.remove(&old);
                    cache.evicted.insert(old);
                }
            }
        }
        debug!(entries = cache.entries.len(), path = %path.display(), "opened completion cache");
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    fn next_stamp(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn touch(&mut self, key: &str) {
        let stamp = self.next_stamp();
        self.stamps.insert(key.to_string(), stamp);
        self.dirty.insert(key.to_string());
    }

    /// Exact lookup. A hit becomes the most recently used entry.
    pub fn get(&mut self, key: &str) -> Option<String> {
        let value = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    /// Completion for `prefix` from the longest stored key that `prefix`
    /// starts with. The text typed past that key must agree with the stored
    /// completion; the agreeing part is stripped from the result.
    pub fn get_by_prefix(&mut self, prefix: &str) -> Option<String> {
        let key_len = (1..=prefix.len())
            .rev()
            .filter(|end| prefix.is_char_boundary(*end))
            .find(|end| self.entries.contains(&prefix[..*end]))?;
        let key = &prefix[..key_len];
        let typed_past = &prefix[key_len..];

        let value = self.entries.get(key).cloned()?;
        let rest = value.strip_prefix(typed_past)?.to_string();
        self.touch(key);
        Some(rest)
    }

    /// Insert or replace. At capacity the least recently used key is evicted.
    pub fn put(&mut self, key: &str, value: &str) {
        if let Some((old, _)) = self.entries.push(key.to_string(), value.to_string()) {
            if old != key {
                self.dirty.remove(&old);
                self.stamps.remove(&old);
                self.evicted.insert(old);
            }
        }
        self.evicted.remove(key);
        self.touch(key);

        if self.last_flush.elapsed() >= self.flush_interval {
            // already logged inside flush
            let _ = self.flush();
        }
    }

    /// Write dirty entries and delete evicted ones in one transaction.
    pub fn flush(&mut self) -> crate::Result<()> {
        if self.dirty.is_empty() && self.evicted.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }
        match self.write_pending() {
            Ok(()) => {
                debug!(
                    written = self.dirty.len(),
                    evicted = self.evicted.len(),
                    "flushed completion cache"
                );
                self.dirty.clear();
                self.evicted.clear();
                self.last_flush = Instant::now();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "completion cache flush failed, rolled back");
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> crate::Result<()> {
        // Dropping the transaction on an early return rolls it back.
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO cache (key, value, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, timestamp = excluded.timestamp",
            )?;
            for key in &self.dirty {
                if let (Some(value), Some(stamp)) = (self.entries.peek(key), self.stamps.get(key)) {
                    upsert.execute(params![key, value, stamp])?;
                }
            }
            let mut delete = tx.prepare_cached("DELETE FROM cache WHERE key = ?1")?;
            for key in &self.evicted {
                delete.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Flush and release the database.
    pub fn close(mut self) -> crate::Result<()> {
        self.flush()
    }
}

impl Drop for CompletionCache {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
