//! In-memory database used by tests and the sim runner.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{Database, KvError, ReadWriter, Reader};

/// A [`Database`] backed by an in-process map.
///
/// Transactions stage their mutations in an overlay and apply them only when
/// the callback succeeds. The write lock is held for the whole transaction,
/// which also enforces the single-writer rule.
#[derive(Default)]
pub struct MemoryDatabase {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

struct MemReader<'a> {
    map: &'a BTreeMap<String, Vec<u8>>,
}

impl Reader for MemReader<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.get(key).cloned())
    }
}

struct MemTxn<'a> {
    map: &'a BTreeMap<String, Vec<u8>>,
    // None marks a staged delete.
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl Reader for MemTxn<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(v) = self.staged.get(key) {
            return Ok(v.clone());
        }
        Ok(self.map.get(key).cloned())
    }
}

impl ReadWriter for MemTxn<'_> {
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.staged.insert(key.to_string(), None);
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn with_reader(
        &self,
        f: &mut dyn FnMut(&dyn Reader) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        let map = self.map.read();
        f(&MemReader { map: &*map })
    }

    fn with_read_writer(
        &self,
        f: &mut dyn FnMut(&mut dyn ReadWriter) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        let mut map = self.map.write();
        let mut txn = MemTxn {
            map: &*map,
            staged: BTreeMap::new(),
        };
        f(&mut txn)?;
        let staged = txn.staged;
        for (key, value) in staged {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
