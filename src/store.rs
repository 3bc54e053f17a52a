//! Hierarchical key/value configuration store.
//!
//! Provider configurations, datasets and checkout records all live in a
//! store addressed by slash-separated paths:
//!
//! ```text
//! /testrun/{id}/provider/{iut|execution-space|log-area|dataset}
//! /testrun/{id}/subsuite/{sub_suite_id}/suite
//! /testrun/{id}/subsuite/{sub_suite_id}/definition
//! /testrun/{id}/suite/{test_suite_started_id}
//! /testrun/{id}/main-suite/{suite_runner_id}
//! /environment/provider/{kind}/{provider_id}
//! ```
//!
//! Reads and writes are atomic per key; nothing here needs multi-key
//! transactions.
//!
//! # Built-in Stores
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | Memory | [`memory`] | In-process map, used by tests and one-shot runs |
//! | File | [`file`] | One file per key below a root directory |

pub mod file;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A path segment was empty or contained a reserved component.
    #[error("Invalid store path: {0}")]
    InvalidPath(String),

    /// The stored bytes were not the JSON the caller expected.
    #[error("Invalid JSON at {path}: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// I/O error in a file-backed store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An absolute, normalized store path.
///
/// Paths always start with `/` and never end with one; empty segments are
/// dropped.
///
/// ```
/// use testbed::store::StorePath;
///
/// let path = StorePath::testrun("abc").join("provider").join("iut");
/// assert_eq!(path.as_str(), "/testrun/abc/provider/iut");
/// assert_eq!(StorePath::new("environment//provider/").as_str(), "/environment/provider");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        Self(format!("/{}", segments.join("/")))
    }

    /// `/testrun/{id}`
    pub fn testrun(id: &str) -> Self {
        Self::new("testrun").join(id)
    }

    /// `/environment/provider`
    pub fn environment_providers() -> Self {
        Self::new("environment/provider")
    }

    /// Appends one or more segments.
    pub fn join(&self, suffix: impl AsRef<str>) -> Self {
        Self::new(format!("{}/{}", self.0, suffix.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, without the leading root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Whether `self` equals `prefix` or lives below it.
    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        if prefix.0 == "/" {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0[prefix.0.len()..].starts_with('/'))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A hierarchical key/value store.
///
/// Implementations must be safe to share between tasks; the engine holds
/// one behind an `Arc` for the lifetime of a testrun.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads a single key.
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Vec<u8>>>;

    /// Reads every key equal to or below `prefix`, ordered by path.
    async fn read_all(&self, prefix: &StorePath) -> StoreResult<Vec<(StorePath, Vec<u8>)>>;

    /// Writes a single key, replacing any previous value.
    async fn write(&self, path: &StorePath, value: &[u8]) -> StoreResult<()>;

    /// Deletes a single key. Deleting a missing key is not an error.
    async fn delete(&self, path: &StorePath) -> StoreResult<()>;

    /// Whether anything exists at or below `prefix`.
    async fn exists(&self, prefix: &StorePath) -> StoreResult<bool> {
        Ok(!self.read_all(prefix).await?.is_empty())
    }
}

/// Reads and deserializes a JSON value, `None` if the key is missing.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ConfigStore,
    path: &StorePath,
) -> StoreResult<Option<T>> {
    match store.read(path).await? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::InvalidJson {
                path: path.to_string(),
                source,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        assert_eq!(StorePath::new("").as_str(), "/");
        assert_eq!(StorePath::new("/a/b/").as_str(), "/a/b");
        assert_eq!(StorePath::new("a").join("/b//c/").as_str(), "/a/b/c");
        assert_eq!(StorePath::new("/a/b/c").name(), Some("c"));
        assert_eq!(StorePath::new("/").name(), None);
    }

    #[test]
    fn test_starts_with_respects_segment_boundaries() {
        let prefix = StorePath::new("/testrun/1");
        assert!(StorePath::new("/testrun/1").starts_with(&prefix));
        assert!(StorePath::new("/testrun/1/provider").starts_with(&prefix));
        assert!(!StorePath::new("/testrun/10/provider").starts_with(&prefix));
        assert!(StorePath::new("/anything").starts_with(&StorePath::new("/")));
    }
}
