//! In-process configuration store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{ConfigStore, StorePath, StoreResult};

/// A [`ConfigStore`] backed by an ordered map.
///
/// Cheap to create, so tests usually build one per case and seed it with
/// [`MemoryStore::insert`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<StorePath, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a key synchronously.
    pub fn insert(&self, path: impl AsRef<str>, value: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(StorePath::new(path), value.into());
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(path).cloned())
    }

    async fn read_all(&self, prefix: &StorePath) -> StoreResult<Vec<(StorePath, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.as_str().starts_with(prefix.as_str()))
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn write(&self, path: &StorePath, value: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(path.clone(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_delete() {
        let store = MemoryStore::new();
        let path = StorePath::new("/testrun/1/provider/iut");

        assert!(store.read(&path).await.unwrap().is_none());
        store.write(&path, b"{}").await.unwrap();
        assert_eq!(store.read(&path).await.unwrap(), Some(b"{}".to_vec()));

        store.delete(&path).await.unwrap();
        assert!(store.read(&path).await.unwrap().is_none());
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_all_only_returns_prefix_children() {
        let store = MemoryStore::new();
        store.insert("/testrun/1/provider/iut", "a");
        store.insert("/testrun/1/provider/log-area", "b");
        store.insert("/testrun/10/provider/iut", "c");
        store.insert("/testrun/1-other", "d");

        let found = store
            .read_all(&StorePath::new("/testrun/1"))
            .await
            .unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["/testrun/1/provider/iut", "/testrun/1/provider/log-area"]
        );

        assert!(store.exists(&StorePath::new("/testrun/10")).await.unwrap());
        assert!(!store.exists(&StorePath::new("/testrun/2")).await.unwrap());
    }
}
