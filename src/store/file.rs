//! Directory-backed configuration store.
//!
//! Every key maps to a directory below the root, and its value is kept in a
//! `.value` file inside that directory. Keys can therefore have both a value
//! and children, which the store hierarchy relies on.
//!
//! ```text
//! {root}/testrun/abc/provider/iut/.value
//! {root}/testrun/abc/provider/dataset/.value
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never observes a half-written value.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{ConfigStore, StoreError, StorePath, StoreResult};

const VALUE_FILE: &str = ".value";

/// A [`ConfigStore`] persisted on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. A leading `~` is expanded.
    pub fn new(root: impl AsRef<str>) -> Self {
        let root = shellexpand::tilde(root.as_ref()).into_owned();
        Self {
            root: PathBuf::from(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, path: &StorePath) -> StoreResult<PathBuf> {
        let mut dir = self.root.clone();
        for segment in path.segments() {
            if segment == "." || segment == ".." || segment == VALUE_FILE {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
            dir.push(segment);
        }
        Ok(dir)
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Vec<u8>>> {
        let file = self.dir_for(path)?.join(VALUE_FILE);
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all(&self, prefix: &StorePath) -> StoreResult<Vec<(StorePath, Vec<u8>)>> {
        let start = self.dir_for(prefix)?;
        let mut found = Vec::new();
        let mut pending = vec![(start, prefix.clone())];

        while let Some((dir, key)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == VALUE_FILE {
                    found.push((key.clone(), tokio::fs::read(entry.path()).await?));
                } else if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key.join(&name)));
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn write(&self, path: &StorePath, value: &[u8]) -> StoreResult<()> {
        let dir = self.dir_for(path)?;
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{}.{}.tmp", VALUE_FILE, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, dir.join(VALUE_FILE)).await?;
        debug!("Wrote {} bytes to {}", value.len(), path);
        Ok(())
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        let file = self.dir_for(path)?.join(VALUE_FILE);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_and_nested_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_string_lossy());

        let parent = StorePath::new("/testrun/1/suite/main");
        let child = StorePath::new("/testrun/1/suite/main/extra");
        store.write(&parent, b"parent").await.unwrap();
        store.write(&child, b"child").await.unwrap();

        assert_eq!(store.read(&parent).await.unwrap(), Some(b"parent".to_vec()));
        assert_eq!(store.read(&child).await.unwrap(), Some(b"child".to_vec()));

        let all = store.read_all(&StorePath::testrun("1")).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, parent);
        assert_eq!(all[1].0, child);
    }

    #[tokio::test]
    async fn test_missing_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_string_lossy());
        let path = StorePath::new("/nothing/here");

        assert!(store.read(&path).await.unwrap().is_none());
        assert!(store.read_all(&path).await.unwrap().is_empty());
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_keeps_children() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_string_lossy());
        let parent = StorePath::new("/a");
        let child = StorePath::new("/a/b");
        store.write(&parent, b"1").await.unwrap();
        store.write(&child, b"2").await.unwrap();

        store.delete(&parent).await.unwrap();
        assert!(store.read(&parent).await.unwrap().is_none());
        assert!(store.read(&child).await.unwrap().is_some());
    }

    #[test]
    fn test_rejects_reserved_segments() {
        let store = FileStore::new("/tmp/unused");
        assert!(store.dir_for(&StorePath::new("/a/../b")).is_err());
        assert!(store.dir_for(&StorePath::new("/a/.value")).is_err());
    }
}
