//! JSON persistence under `<config>/.storage/`
//!
//! Every file is an envelope carrying a version pair and the storage key:
//!
//! ```json
//! {
//!   "version": 1,
//!   "minor_version": 1,
//!   "key": "core.device_registry",
//!   "data": { ... }
//! }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage {key} has version {found}, expected {expected}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Versioned envelope around stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

/// Types persisted as a single storage file
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;
}

/// Handle on the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load `T` from its storage file; `None` when the file does not exist yet
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<T>> {
        let path = self.file_path(T::KEY);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = T::KEY, "Storage file not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let file: StorageFile<T> = serde_json::from_str(&content)?;
        if file.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: file.version,
            });
        }
        if file.minor_version > T::MINOR_VERSION {
            warn!(
                key = T::KEY,
                found = file.minor_version,
                supported = T::MINOR_VERSION,
                "Storage written by a newer minor version"
            );
        }

        debug!(key = T::KEY, version = file.version, "Loaded storage file");
        Ok(Some(file.data))
    }

    /// Write `data` atomically: temp file first, then rename over the target
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let file = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&file)?;

        let path = self.file_path(T::KEY);
        let temp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(key = T::KEY, "Saved storage file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bookmarks {
        serials: Vec<String>,
    }

    impl Storable for Bookmarks {
        const KEY: &'static str = "test.bookmarks";
        const VERSION: u32 = 2;
        const MINOR_VERSION: u32 = 1;
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let data = Bookmarks {
            serials: vec!["D4A1B2".to_string()],
        };
        storage.save(&data).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(".storage/test.bookmarks")).unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["version"], 2);
        assert_eq!(envelope["key"], "test.bookmarks");
        assert!(!dir.path().join(".storage/test.bookmarks.tmp").exists());

        let loaded: Option<Bookmarks> = storage.load().await.unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let loaded: Option<Bookmarks> = storage.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(storage.storage_dir()).unwrap();
        std::fs::write(
            storage.file_path("test.bookmarks"),
            r#"{"version": 1, "minor_version": 1, "key": "test.bookmarks", "data": {"serials": []}}"#,
        )
        .unwrap();

        let result = storage.load::<Bookmarks>().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionMismatch { found: 1, .. })
        ));
    }
}
