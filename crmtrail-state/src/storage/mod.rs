//! Storage module
//!
//! Key/value stores holding watermarks and job documents. A missing key reads
//! as `None`, never as an error.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use async_trait::async_trait;
use crmtrail_core::error::{CrmTrailError, Result};
use log::debug;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

mod blob;

pub use blob::{BlobCredentials, BlobStateStore};

/// State store trait
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the value stored under `key`
    async fn load_raw(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn save_raw(&self, key: &str, value: &str) -> Result<()>;
}

/// Extension methods for StateStore
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Load a JSON document; a missing or blank value reads as `None`
    async fn load_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.load_raw(key).await? {
            Some(text) if !text.trim().is_empty() => {
                let document = serde_json::from_str(&text).map_err(|e| {
                    CrmTrailError::Config(format!("Document '{}' is not valid JSON: {}", key, e))
                })?;
                Ok(Some(document))
            }
            _ => Ok(None),
        }
    }
}

// Implement StateStoreExt for all StateStore implementors
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// File-based state store, one file per key
pub struct FileStateStore {
    /// Base directory for state files
    base_dir: PathBuf,
}

impl FileStateStore {
    /// Create a new file-based state store
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Get the file path for a key
    fn get_file_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(CrmTrailError::State(format!("Invalid state key '{}'", key)));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let file_path = self.get_file_path(key)?;

        match tokio::fs::read_to_string(&file_path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CrmTrailError::State(format!(
                "Failed to read state file {}: {}",
                file_path.display(),
                e
            ))),
        }
    }

    async fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        let file_path = self.get_file_path(key)?;

        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // write-then-rename so readers never observe a partial value
        let mut temp_name = file_path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        tokio::fs::write(&temp_path, value).await?;
        tokio::fs::rename(&temp_path, &file_path).await?;

        debug!("Saved state key {} to {}", key, file_path.display());
        Ok(())
    }
}

/// In-memory state store
pub struct MemoryStateStore {
    storage: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty in-memory state store
    pub fn new() -> Self {
        Self { storage: RwLock::new(HashMap::new()) }
    }

    /// Create a store pre-populated with values
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let storage = values.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { storage: RwLock::new(storage) }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let storage = self.storage.read().await;
        Ok(storage.get(key).cloned())
    }

    async fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Filter {
        names: Vec<String>,
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();

        assert_eq!(store.load_raw("lastdate.txt").await.unwrap(), None);

        store.save_raw("lastdate.txt", "2024-01-01T00:00:00Z").await.unwrap();
        assert_eq!(
            store.load_raw("lastdate.txt").await.unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );

        store.save_raw("lastdate.txt", "2024-01-01T02:00:00Z").await.unwrap();
        assert_eq!(
            store.load_raw("lastdate.txt").await.unwrap().as_deref(),
            Some("2024-01-01T02:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert_eq!(store.load_raw("jobs/delta.txt").await.unwrap(), None);

        store.save_raw("jobs/delta.txt", "2024-01-01T02:00:00Z").await.unwrap();
        assert_eq!(
            store.load_raw("jobs/delta.txt").await.unwrap().as_deref(),
            Some("2024-01-01T02:00:00Z")
        );
        assert!(dir.path().join("jobs/delta.txt").exists());
        assert!(!dir.path().join("jobs/delta.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(store.load_raw("../outside.txt").await.is_err());
        assert!(store.save_raw("/etc/passwd", "x").await.is_err());
        assert!(store.save_raw("", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_load_json() {
        let store = MemoryStateStore::with_values([
            ("filter.json", r#"{"names": ["a", "b"]}"#),
            ("blank.json", "  "),
            ("broken.json", "{not json"),
        ]);

        let filter: Option<Filter> = store.load_json("filter.json").await.unwrap();
        assert_eq!(filter, Some(Filter { names: vec!["a".into(), "b".into()] }));

        let blank: Option<Filter> = store.load_json("blank.json").await.unwrap();
        assert_eq!(blank, None);

        let missing: Option<Filter> = store.load_json("missing.json").await.unwrap();
        assert_eq!(missing, None);

        let broken = store.load_json::<Filter>("broken.json").await;
        assert!(matches!(broken, Err(CrmTrailError::Config(_))));
    }
}
