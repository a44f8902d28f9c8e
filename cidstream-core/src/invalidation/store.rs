//! Key-value persistence backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;

/// Persistence capability for small JSON documents keyed by name.
///
/// Implementations must make `save` atomic: a concurrent or interrupted
/// write never leaves a partially written value behind.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Loads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the backend could not be read
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the backend could not be written
    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Errors raised while reading or writing persisted state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt persisted value under {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid store key {key:?}")]
    InvalidKey { key: String },
}

/// In-memory store, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One JSON file per key inside a state directory.
///
/// Writes go to `<key>.json<suffix>` first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    temp_suffix: String,
}

impl FileStore {
    /// Creates a store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>, temp_suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            temp_suffix: temp_suffix.into(),
        }
    }

    /// Directory holding the persisted files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir).await?;

        let mut temp = path.clone().into_os_string();
        temp.push(&self.temp_suffix);
        let temp = PathBuf::from(temp);

        fs::write(&temp, value).await?;
        fs::rename(&temp, &path).await?;
        tracing::trace!("Persisted {} ({} bytes)", path.display(), value.len());
        Ok(())
    }
}
