//! A volatile, in-memory [`KVStore`] for tests that check what operators persist.
//!
//! [`KVStorage`] lays its keys out as a one-byte prefix followed by the bytes of the duty stream's
//! [`MessageID`], that is, the validator public key and then the role code:
//! - `[0] ++ identifier`: the highest decided message of the stream.
//! - `[1] ++ identifier`: the decided duty of the stream's latest decided instance.
//!
//! [`MessageID`]: qbft_rs::types::data_types::MessageID

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use qbft_rs::storage::{KVGet, KVStorage, KVStore, WriteBatch};

/// A map from storage keys to borsh-encoded values. Clones share the same map, so a test can keep a
/// handle on what an operator's storage holds.
#[derive(Clone)]
pub(crate) struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    /// Create a new, empty `MemDB`.
    pub(crate) fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(HashMap::new())))
    }

    /// Create a `KVStorage` over a new, empty `MemDB`.
    pub(crate) fn storage() -> Arc<KVStorage<MemDB>> {
        Arc::new(KVStorage::new(MemDB::new()))
    }
}

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

/// Insertions and deletions applied together by [`MemDB::write`]. A later operation on a key replaces
/// an earlier one.
pub(crate) struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}
