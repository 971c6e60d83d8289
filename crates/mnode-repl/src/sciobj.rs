//! Storage for replicated object bytes.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use mnode_meta::Pid;

use crate::error::ReplError;

/// Byte store for science objects. Writes replace existing content, so a
/// retried replication overwrites the partial result of an earlier attempt.
#[async_trait]
pub trait SciObjStore: Send + Sync {
    /// Stores `data` under `pid`.
    async fn put(&self, pid: &Pid, data: Bytes) -> Result<(), ReplError>;

    /// Bytes stored under `pid`.
    async fn get(&self, pid: &Pid) -> Result<Option<Bytes>, ReplError>;

    /// Returns true if bytes are stored under `pid`.
    async fn exists(&self, pid: &Pid) -> Result<bool, ReplError>;
}

/// In-memory [`SciObjStore`].
#[derive(Default)]
pub struct MemorySciObjStore {
    objects: RwLock<HashMap<Pid, Bytes>>,
}

impl MemorySciObjStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl SciObjStore for MemorySciObjStore {
    async fn put(&self, pid: &Pid, data: Bytes) -> Result<(), ReplError> {
        debug!(pid = %pid, bytes = data.len(), "storing object bytes");
        self.objects.write().await.insert(pid.clone(), data);
        Ok(())
    }

    async fn get(&self, pid: &Pid) -> Result<Option<Bytes>, ReplError> {
        Ok(self.objects.read().await.get(pid).cloned())
    }

    async fn exists(&self, pid: &Pid) -> Result<bool, ReplError> {
        Ok(self.objects.read().await.contains_key(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemorySciObjStore::new();
        let pid = Pid::from("p1");
        assert!(!store.exists(&pid).await.unwrap());
        store.put(&pid, Bytes::from_static(b"partial")).await.unwrap();
        store.put(&pid, Bytes::from_static(b"complete")).await.unwrap();
        assert_eq!(
            store.get(&pid).await.unwrap(),
            Some(Bytes::from_static(b"complete"))
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemorySciObjStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.get(&Pid::from("nope")).await.unwrap(), None);
    }
}
