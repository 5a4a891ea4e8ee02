//! Reference-counted handle registry
//!
//! Backends share one physical handle (an LMDB environment, an in-memory
//! state) across every logical instance opened with identical parameters.
//! The registry is owned by the storage factory and injected into the
//! instances it creates; nothing here is process-global.

use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

struct Entry<V> {
    value: V,
    refs: usize,
}

/// Map from key to shared handle with a reference count per key
pub struct HandleRegistry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for HandleRegistry<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> HandleRegistry<K, V> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count of `key`, creating the handle when absent
    pub fn acquire_or_insert_with<F>(&self, key: K, create: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(entry.value.clone());
        }
        let value = create()?;
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                refs: 1,
            },
        );
        Ok(value)
    }

    /// Decrement the count; returns the handle when the last reference went away
    pub fn release(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(key).map(|e| e.value)
        } else {
            None
        }
    }

    /// Drop the handle regardless of its count
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Current handle for `key` without touching the count
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    /// Number of live references to `key`
    pub fn ref_count(&self, key: &K) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refs)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no handle is open
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_ref_counting() {
        let registry: HandleRegistry<String, u32> = HandleRegistry::new();
        let mut created = 0;
        for _ in 0..2 {
            registry
                .acquire_or_insert_with("db".to_string(), || {
                    created += 1;
                    Ok(7)
                })
                .unwrap();
        }
        assert_eq!(created, 1);
        assert_eq!(registry.ref_count(&"db".to_string()), 2);
        assert_eq!(registry.release(&"db".to_string()), None);
        assert_eq!(registry.release(&"db".to_string()), Some(7));
        assert!(registry.is_empty());
        assert_eq!(registry.release(&"db".to_string()), None);
    }

    #[test]
    fn test_failed_create_registers_nothing() {
        let registry: HandleRegistry<&str, u32> = HandleRegistry::new();
        let result = registry.acquire_or_insert_with("x", || Err(Error::internal("boom")));
        assert!(result.is_err());
        assert_eq!(registry.ref_count(&"x"), 0);
    }
}
