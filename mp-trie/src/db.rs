//! Storage abstraction for trie nodes. Nodes are keyed by their keccak256
//! hash; values are the node's RLP encoding.

use std::{convert::Infallible, error::Error, sync::Mutex};

use hashbrown::HashMap;

pub trait DB: Send + Sync {
    type Error: Error;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error>;

    fn remove(&self, key: &[u8]) -> Result<(), Self::Error>;

    /// Inserts a batch of key/value pairs. `keys` and `values` run parallel.
    fn insert_batch(&self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<(), Self::Error>;

    fn remove_batch(&self, keys: &[Vec<u8>]) -> Result<(), Self::Error>;
}

/// In-memory node store, used for tests and proof verification.
#[derive(Debug, Default)]
pub struct MemoryDB {
    storage: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// When unset, removals are ignored. Archival callers keep stale nodes
    /// around so historical roots stay readable.
    deletion_enabled: bool,
}

impl MemoryDB {
    pub fn new(deletion_enabled: bool) -> Self {
        MemoryDB {
            storage: Mutex::new(HashMap::new()),
            deletion_enabled,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the stored entries.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.storage
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl DB for MemoryDB {
    type Error = Infallible;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.storage.lock().unwrap().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error> {
        self.storage.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Self::Error> {
        if self.deletion_enabled {
            self.storage.lock().unwrap().remove(key);
        }
        Ok(())
    }

    fn insert_batch(&self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<(), Self::Error> {
        let mut storage = self.storage.lock().unwrap();
        for (key, value) in keys.into_iter().zip(values) {
            storage.insert(key, value);
        }
        Ok(())
    }

    fn remove_batch(&self, keys: &[Vec<u8>]) -> Result<(), Self::Error> {
        if self.deletion_enabled {
            let mut storage = self.storage.lock().unwrap();
            for key in keys {
                storage.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_db_basics() {
        let db = MemoryDB::new(true);
        db.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.remove(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn memory_db_without_deletion() {
        let db = MemoryDB::new(false);
        db.insert(b"k", b"v".to_vec()).unwrap();
        db.remove(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
