// Storage Port
// Byte-addressed hierarchical store for backup artifacts

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::JobError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidPath(_) => JobError::Permanent(err.to_string()),
            _ => JobError::Transient(err.to_string()),
        }
    }
}

/// Storage interface.
///
/// Paths are relative and `/`-separated. The engine writes each path from a
/// single job, so implementations need no locking beyond atomic writes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write (or overwrite) a blob, creating parents as needed
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Names of the direct children of `path`, sorted
    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Verify the store can be written before a run starts
    async fn ensure_writable(&self) -> Result<(), StorageError>;

    /// Location of `path` on the local host (git mirrors live here)
    fn local_path(&self, path: &str) -> PathBuf;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory storage; `local_path` resolves under a caller-chosen root
    pub struct MemoryStorage {
        blobs: Mutex<BTreeMap<String, Vec<u8>>>,
        read_only: AtomicBool,
        local_root: PathBuf,
    }

    impl Default for MemoryStorage {
        fn default() -> Self {
            Self {
                blobs: Mutex::new(BTreeMap::new()),
                read_only: AtomicBool::new(false),
                local_root: std::env::temp_dir().join("bitvault-memory-storage"),
            }
        }
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_local_root(root: impl Into<PathBuf>) -> Self {
            Self {
                local_root: root.into(),
                ..Self::default()
            }
        }

        /// Storage whose writability probe fails
        pub fn read_only() -> Self {
            let storage = Self::default();
            storage.read_only.store(true, Ordering::SeqCst);
            storage
        }

        pub fn paths(&self) -> Vec<String> {
            self.blobs.lock().unwrap().keys().cloned().collect()
        }

        pub fn get_json(&self, path: &str) -> Option<serde_json::Value> {
            self.blobs
                .lock()
                .unwrap()
                .get(path)
                .and_then(|b| serde_json::from_slice(b).ok())
        }
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            if self.read_only.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("read-only".to_string()));
            }
            self.blobs
                .lock()
                .unwrap()
                .insert(path.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.blobs
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn exists(&self, path: &str) -> Result<bool, StorageError> {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let blobs = self.blobs.lock().unwrap();
            Ok(blobs.contains_key(path) || blobs.keys().any(|k| k.starts_with(&prefix)))
        }

        async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{}/", path.trim_end_matches('/'))
            };
            let blobs = self.blobs.lock().unwrap();
            let mut names: Vec<String> = blobs
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter_map(|rest| rest.split('/').next())
                .map(|s| s.to_string())
                .collect();
            names.dedup();
            Ok(names)
        }

        async fn ensure_writable(&self) -> Result<(), StorageError> {
            if self.read_only.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("read-only".to_string()));
            }
            Ok(())
        }

        fn local_path(&self, path: &str) -> PathBuf {
            self.local_root.join(path)
        }
    }

}
