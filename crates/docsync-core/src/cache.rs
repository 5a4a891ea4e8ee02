//! Document cache
//!
//! Deduplicates document wrappers per primary key: as long as a wrapper
//! for `(primary key, revision)` is alive somewhere, reads of that state
//! return the same `Arc`. The cache only holds weak references, so it never
//! keeps a document alive on its own.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A wrapper the cache can deduplicate
pub trait CachedDocument: Send + Sync {
    /// Revision of the wrapped state
    fn revision(&self) -> &str;
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered with an existing wrapper
    pub hits: u64,
    /// Lookups that created a wrapper
    pub misses: u64,
    /// Entries currently tracked
    pub entries: usize,
}

/// Primary key to live wrapper map
pub struct DocumentCache<D> {
    entries: DashMap<String, Weak<D>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<D> Default for DocumentCache<D> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<D: CachedDocument> DocumentCache<D> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapper for `id` at `revision`, created with `create` when no live
    /// wrapper of that revision exists
    pub fn get_or_insert_with<F>(&self, id: &str, revision: &str, create: F) -> Arc<D>
    where
        F: FnOnce() -> D,
    {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(doc) = entry.get().upgrade() {
                    if doc.revision() == revision {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return doc;
                    }
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                let doc = Arc::new(create());
                entry.insert(Arc::downgrade(&doc));
                doc
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let doc = Arc::new(create());
                entry.insert(Arc::downgrade(&doc));
                doc
            }
        }
    }

    /// Latest live wrapper of `id`
    pub fn get(&self, id: &str) -> Option<Arc<D>> {
        self.entries.get(id).and_then(|weak| weak.upgrade())
    }

    /// Forget `id`
    pub fn invalidate(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Drop entries whose wrapper is gone; returns how many were dropped
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doc {
        rev: String,
    }

    impl CachedDocument for Doc {
        fn revision(&self) -> &str {
            &self.rev
        }
    }

    fn doc(rev: &str) -> Doc {
        Doc {
            rev: rev.to_string(),
        }
    }

    #[test]
    fn test_same_revision_same_arc() {
        let cache = DocumentCache::new();
        let a = cache.get_or_insert_with("x", "1-a", || doc("1-a"));
        let b = cache.get_or_insert_with("x", "1-a", || doc("1-a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().hits, 1);

        let c = cache.get_or_insert_with("x", "2-a", || doc("2-a"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.get("x").unwrap().revision(), "2-a");
    }

    #[test]
    fn test_weak_entries_are_pruned() {
        let cache = DocumentCache::new();
        {
            let _held = cache.get_or_insert_with("x", "1-a", || doc("1-a"));
            assert!(cache.get("x").is_some());
        }
        assert!(cache.get("x").is_none());
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.stats().entries, 0);
    }
}
