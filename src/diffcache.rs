//! Bounded LRU cache for computed per-file diffs.
//!
//! Keys are `<base>..<head>:<path>`. Values are deep-copied on both set and
//! get inside the lock so no shared mutable state escapes. Working-tree diffs
//! (empty `head`) are never cached: they change underfoot.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// One hunk of a file diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub header: String,
    pub lines: Vec<String>,
}

/// A computed diff for a single file between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub hunks: Vec<DiffHunk>,
    #[serde(default)]
    pub binary: bool,
}

/// Cache key for a file diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffKey {
    pub base: String,
    pub head: String,
    pub path: String,
}

impl DiffKey {
    pub fn new(base: &str, head: &str, path: &str) -> Self {
        Self {
            base: base.to_string(),
            head: head.to_string(),
            path: path.to_string(),
        }
    }

    /// A working-tree diff compares against an unpinned head.
    pub fn is_working_tree(&self) -> bool {
        self.head.is_empty()
    }

    pub fn render(&self) -> String {
        format!("{}..{}:{}", self.base, self.head, self.path)
    }

    /// Prefix covering every file of a `<base>..<head>` pair.
    pub fn range_prefix(base: &str, head: &str) -> String {
        format!("{}..{}:", base, head)
    }
}

/// Thread-safe, bounded diff cache.
pub struct DiffCache {
    inner: Mutex<LruCache<String, FileDiff>>,
}

impl DiffCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a copy of the cached diff, promoting it to most-recently-used.
    pub fn get(&self, key: &DiffKey) -> Option<FileDiff> {
        if key.is_working_tree() {
            return None;
        }
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&key.render()).cloned()
    }

    /// Store a copy of the diff, evicting the least-recently-used entry at
    /// capacity. Working-tree keys are ignored.
    pub fn set(&self, key: &DiffKey, diff: &FileDiff) {
        if key.is_working_tree() {
            return;
        }
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key.render(), diff.clone());
    }

    /// Remove all entries whose key starts with `prefix`.
    pub fn invalidate(&self, prefix: &str) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn clear(&self) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
    }

    pub fn len(&self) -> usize {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DiffCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(path: &str) -> FileDiff {
        FileDiff {
            path: path.to_string(),
            old_path: None,
            hunks: vec![DiffHunk {
                header: "@@ -1 +1 @@".into(),
                lines: vec!["-old".into(), "+new".into()],
            }],
            binary: false,
        }
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = DiffCache::new(10);
        let key = DiffKey::new("abc", "def", "src/main.rs");
        cache.set(&key, &diff("src/main.rs"));

        let got = cache.get(&key).unwrap();
        assert_eq!(got.path, "src/main.rs");
        assert!(cache.get(&DiffKey::new("abc", "def", "other.rs")).is_none());
    }

    #[test]
    fn test_capacity_bound_and_lru_eviction() {
        let cache = DiffCache::new(2);
        let k1 = DiffKey::new("a", "b", "one.rs");
        let k2 = DiffKey::new("a", "b", "two.rs");
        let k3 = DiffKey::new("a", "b", "three.rs");

        cache.set(&k1, &diff("one.rs"));
        cache.set(&k2, &diff("two.rs"));
        // Touch k1 so k2 becomes least recently used.
        cache.get(&k1);
        cache.set(&k3, &diff("three.rs"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_get_returns_isolated_copy() {
        let cache = DiffCache::new(10);
        let key = DiffKey::new("a", "b", "one.rs");
        cache.set(&key, &diff("one.rs"));

        let mut copy = cache.get(&key).unwrap();
        copy.hunks.clear();
        copy.path = "mutated".into();

        let stored = cache.get(&key).unwrap();
        assert_eq!(stored.path, "one.rs");
        assert_eq!(stored.hunks.len(), 1);
    }

    #[test]
    fn test_working_tree_diffs_not_cached() {
        let cache = DiffCache::new(10);
        let key = DiffKey::new("abc", "", "src/main.rs");
        assert!(key.is_working_tree());

        cache.set(&key, &diff("src/main.rs"));
        assert_eq!(cache.len(), 0);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = DiffCache::new(10);
        cache.set(&DiffKey::new("a", "b", "one.rs"), &diff("one.rs"));
        cache.set(&DiffKey::new("a", "b", "two.rs"), &diff("two.rs"));
        cache.set(&DiffKey::new("a", "c", "one.rs"), &diff("one.rs"));

        cache.invalidate(&DiffKey::range_prefix("a", "b"));

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&DiffKey::new("a", "c", "one.rs")).is_some());
    }

    #[test]
    fn test_clear_and_len() {
        let cache = DiffCache::new(10);
        cache.set(&DiffKey::new("a", "b", "one.rs"), &diff("one.rs"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
