//! Key/value storage for slick with pluggable backends.
//!
//! Two stores back the engagement facade: a durable one that survives
//! restarts (reader identity, navigation hint) and a session-scoped one that
//! lives only as long as the process. Values are strings; JSON helpers are
//! layered on top through [`KeyValueStoreExt`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted data could not be read back
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// String key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// JSON encoding helpers available on every store
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and decode a JSON value
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    async fn set_json<T>(&self, key: &str, value: &T) -> Result<(), StorageError>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Store backend configuration
#[derive(Clone, Debug, Default)]
pub enum StoreMode {
    /// In-memory store, lost on exit
    #[default]
    InMemory,
    /// JSON file under a data directory
    File {
        /// Data directory path
        data_dir: String,
    },
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;

/// Open a single store for the given mode
pub async fn open_store(mode: StoreMode) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match mode {
        StoreMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StoreMode::File { data_dir } => {
            let config = FileStoreConfig {
                data_dir: data_dir.into(),
                ..Default::default()
            };
            Ok(Arc::new(FileStore::open(config).await?))
        }
    }
}

/// The durable and session-scoped stores used together by the facade
#[derive(Clone)]
pub struct Stores {
    /// Survives restarts when backed by a file
    pub durable: Arc<dyn KeyValueStore>,
    /// Lives for the current process only
    pub session: Arc<dyn KeyValueStore>,
}

impl Stores {
    /// Create stores from configuration; the session store is always in memory
    pub async fn from_mode(mode: StoreMode) -> Result<Self, StorageError> {
        Ok(Stores {
            durable: open_store(mode).await?,
            session: Arc::new(MemoryStore::new()),
        })
    }

    /// Two independent in-memory stores
    pub fn in_memory() -> Self {
        Stores {
            durable: Arc::new(MemoryStore::new()),
            session: Arc::new(MemoryStore::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
