//! Byte-keyed storage backends.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

/// A durable byte-keyed, byte-valued map. Writes of a single key are atomic;
/// no multi-key transaction support is offered or needed by the trie layer.
pub trait Database: Send + Sync {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>);

    /// Returns `true` if `key` has a stored value.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Shared handle to a [`Database`].
pub type DatabaseHandle = Arc<dyn Database>;

/// In-memory [`Database`] for tests and light deployments.
#[derive(Debug, Default)]
pub struct MemoryDb {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// All key/value pairs, sorted by key. Intended for tests that assert a
    /// failed operation left the store untouched.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<_> = self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        entries
    }
}

impl Database for MemoryDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: Vec<u8>) {
        self.map.write().insert(key.to_vec(), value);
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.map.read().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let db = MemoryDb::new();
        assert!(db.is_empty());

        db.put(b"alpha", vec![1, 2, 3]);
        assert_eq!(db.get(b"alpha"), Some(vec![1, 2, 3]));
        assert!(db.contains(b"alpha"));
        assert!(!db.contains(b"beta"));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn put_replaces_previous_value() {
        let db = MemoryDb::new();
        db.put(b"k", vec![1]);
        db.put(b"k", vec![2]);
        assert_eq!(db.get(b"k"), Some(vec![2]));
        assert_eq!(db.len(), 1);
    }
}
