//! Content digests used as cache keys.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// SHA-256 hex digest of a file's bytes.
pub fn content_key(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Remembers digests computed during one refresh so the index kinds of a root
/// hash each changed file once. Entries are keyed by `(path, mtime)`; a file
/// touched again mid-pass gets a new entry.
#[derive(Default)]
pub struct HashMemo {
    entries: Mutex<HashMap<(String, i64), String>>,
}

impl HashMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str, mtime: i64) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries.get(&(path.to_string(), mtime)).cloned()
    }

    pub fn insert(&self, path: &str, mtime: i64, key: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((path.to_string(), mtime), key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_same_key() {
        assert_eq!(content_key(b"X"), content_key(b"X"));
        assert_ne!(content_key(b"X"), content_key(b"Y"));
        assert_eq!(
            content_key(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_memo_is_keyed_by_mtime() {
        let memo = HashMemo::new();
        memo.insert("a.py", 10, "k1".to_string());
        assert_eq!(memo.get("a.py", 10).as_deref(), Some("k1"));
        assert_eq!(memo.get("a.py", 11), None);
        assert_eq!(memo.len(), 1);
    }
}
