//! Ordered key-value storage underneath the metadata store.
//!
//! Records are stored as bincode blobs under string-prefixed keys. The only
//! multi-key write primitive is [`KvStore::write_batch`], which backends must
//! apply atomically.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::MetaError;

/// A stored key and its value.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Ordered key-value backend.
pub trait KvStore: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError>;

    /// Removes `key`. Missing keys are not an error.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Applies every operation or none of them.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// One staged mutation of a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Target key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target key.
        key: Vec<u8>,
    },
}

/// In-memory backend on a `BTreeMap` behind an `RwLock`. Contents are lost
/// when the store is dropped.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize, MetaError> {
        Ok(self.read_map()?.len())
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> Result<bool, MetaError> {
        Ok(self.read_map()?.is_empty())
    }

    fn read_map(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, MetaError> {
        self.data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }

    fn write_map(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, MetaError> {
        self.data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self.read_map()?.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        self.write_map()?.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.write_map()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.read_map()?;
        Ok(data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self.write_map()?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
