//! JSON-file key/value backend.

use crate::{KvStore, StorageError, StorageResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File name used under the default data directory.
const DEFAULT_FILE_NAME: &str = "vault.json";

/// Durable key/value backend persisted as a single JSON object.
///
/// The full map is rewritten on every mutation via a temp-file rename, so a
/// crash mid-write never leaves a torn file behind.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) a file store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| StorageError::Encoding(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Open a store at the platform default location
    /// (`<data_dir>/versecraft/vault.json`).
    pub fn open_default() -> StorageResult<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| StorageError::Backend("No data directory for platform".to_string()))?
            .join("versecraft");
        std::fs::create_dir_all(&dir)?;
        Self::open(dir.join(DEFAULT_FILE_NAME))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, data: &HashMap<String, String>) -> StorageResult<()> {
        let content =
            serde_json::to_string_pretty(data).map_err(|e| StorageError::Encoding(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), value.to_string());
        self.flush(&data)
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut data = self.data.lock().unwrap();
        let removed = data.remove(key).is_some();
        if removed {
            self.flush(&data)?;
        }
        Ok(removed)
    }
}
