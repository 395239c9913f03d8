//! File-backed durable store

use crate::{KeyValueStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Name of the JSON file inside the data directory
    pub file_name: String,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./slickdata"),
            file_name: "store.json".to_string(),
        }
    }
}

/// Durable key/value store persisted as one JSON object.
///
/// Reads are served from memory. Every write rewrites the file through a
/// temporary sibling and a rename, so a crash leaves either the old or the
/// new content on disk.
pub struct FileStore {
    config: FileStoreConfig,
    entries: Arc<DashMap<String, String>>,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, loading existing content
    pub async fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Self {
            config,
            entries: Arc::new(DashMap::new()),
            write_lock: Mutex::new(()),
        };
        store.load()?;
        Ok(store)
    }

    /// Location of the backing file
    pub fn path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.file_name)
    }

    fn load(&self) -> Result<(), StorageError> {
        let path = self.path();
        if !path.exists() {
            debug!("No store file at {}, starting empty", path.display());
            return Ok(());
        }

        let content = std::fs::read_to_string(&path)?;
        let map: BTreeMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            StorageError::Corruption(format!("Invalid store file {}: {}", path.display(), e))
        })?;

        info!("Loaded {} key(s) from {}", map.len(), path.display());
        for (key, value) in map {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();

        let snapshot: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let content = serde_json::to_string_pretty(&snapshot)?;

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            warn!("Failed to replace {}: {}", path.display(), e);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        debug!("File store set key={} len={}", key, value.len());
        self.entries.insert(key.to_string(), value.to_string());
        self.persist()
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        debug!("File store delete key={}", key);
        self.persist()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> FileStoreConfig {
        FileStoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(config(&dir)).await.unwrap();
            store.set("reader", "1718000000000.x7f3").await.unwrap();
            store.set("hint", "{}").await.unwrap();
            assert!(store.delete("hint").await.unwrap());
            assert!(!store.delete("hint").await.unwrap());
        }

        let store = FileStore::open(config(&dir)).await.unwrap();
        assert_eq!(
            store.get("reader").await.unwrap().as_deref(),
            Some("1718000000000.x7f3")
        );
        assert!(store.get("hint").await.unwrap().is_none());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("store.json"), "[oops").unwrap();

        let result = FileStore::open(config(&dir)).await;
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = FileStoreConfig {
            data_dir: dir.path().join("a").join("b"),
            file_name: "kv.json".to_string(),
        };

        let store = FileStore::open(nested).await.unwrap();
        store.set("k", "v").await.unwrap();
        assert!(dir.path().join("a/b/kv.json").exists());
    }
}
