//! Minimal key-value store surface used for fast-sync state nodes and the
//! trie download progress marker.

use std::{collections::BTreeMap, sync::Mutex};

use anyhow::Result;

/// Write batch accumulated in memory and flushed with `write`.
pub trait KvBatch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]);

    fn write(&mut self) -> Result<()>;

    fn reset(&mut self);
}

pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn batch(&self) -> Box<dyn KvBatch + '_>;
}

/// Key under which the number of processed state entries is persisted, so an
/// interrupted fast sync resumes its progress counter.
const FAST_TRIE_PROGRESS_KEY: &[u8] = b"TrieSync";

pub fn read_fast_trie_progress(db: &dyn Kv) -> u64 {
    let Ok(Some(raw)) = db.get(FAST_TRIE_PROGRESS_KEY) else {
        return 0;
    };
    let mut count = 0u64;
    for &b in raw.iter().take(8) {
        count = (count << 8) | b as u64;
    }
    count
}

pub fn write_fast_trie_progress(db: &dyn Kv, count: u64) -> Result<()> {
    let bytes = count.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    db.put(FAST_TRIE_PROGRESS_KEY, &bytes[start..])
}

/// In-memory [Kv], used by tests and as the default state store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    storage: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn batch(&self) -> Box<dyn KvBatch + '_> {
        Box::new(MemoryBatch {
            db: self,
            writes: Vec::new(),
        })
    }
}

struct MemoryBatch<'a> {
    db: &'a MemoryKv,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
}

impl KvBatch for MemoryBatch<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.writes.push((key.to_vec(), value.to_vec()));
    }

    fn write(&mut self) -> Result<()> {
        let mut storage = self.db.storage.lock().unwrap();
        for (key, value) in self.writes.drain(..) {
            storage.insert(key, value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.writes.clear();
    }
}

/// Exposes a [Kv] as a trie node store, so committed state can be read back
/// through the trie crate.
pub struct TrieKv {
    inner: std::sync::Arc<dyn Kv>,
}

impl TrieKv {
    pub fn new(inner: std::sync::Arc<dyn Kv>) -> Self {
        TrieKv { inner }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct KvError(String);

impl mp_trie::DB for TrieKv {
    type Error = KvError;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        self.inner.get(key).map_err(|e| KvError(e.to_string()))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error> {
        self.inner
            .put(key, &value)
            .map_err(|e| KvError(e.to_string()))
    }

    fn remove(&self, _key: &[u8]) -> Result<(), Self::Error> {
        // State nodes are content-addressed and never deleted here.
        Ok(())
    }

    fn insert_batch(&self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<(), Self::Error> {
        let mut batch = self.inner.batch();
        for (key, value) in keys.iter().zip(values.iter()) {
            batch.put(key, value);
        }
        batch.write().map_err(|e| KvError(e.to_string()))
    }

    fn remove_batch(&self, _keys: &[Vec<u8>]) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_round_trip() {
        let db = MemoryKv::new();
        assert_eq!(read_fast_trie_progress(&db), 0);
        write_fast_trie_progress(&db, 123_456).unwrap();
        assert_eq!(read_fast_trie_progress(&db), 123_456);
    }

    #[test]
    fn batch_writes_atomically() {
        let db = MemoryKv::new();
        let mut batch = db.batch();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        assert_eq!(db.get(b"a").unwrap(), None);
        batch.write().unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));

        let mut batch = db.batch();
        batch.put(b"c", b"3");
        batch.reset();
        batch.write().unwrap();
        assert_eq!(db.get(b"c").unwrap(), None);
    }
}
