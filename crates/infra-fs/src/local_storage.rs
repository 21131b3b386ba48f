// Local filesystem storage
// Writes land in a sibling temp file and are renamed into place, so a reader
// never observes a half-written document.
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use bitvault_core::port::{Storage, StorageError};

/// Storage rooted at a local directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative `/`-separated path under the root, rejecting escapes
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        if rel.is_absolute() {
            return Err(StorageError::InvalidPath(format!("absolute path: {}", path)));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(StorageError::InvalidPath(format!(
                        "path escapes storage root: {}",
                        path
                    )))
                }
            }
        }
        Ok(self.root.join(rel))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
            return Err(StorageError::InvalidPath(format!("not a file path: {}", path)));
        };

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Self::io_error(parent, e))?;

        let tmp = parent.join(format!(
            ".{}.{}.tmp",
            name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
            }
            return Err(Self::io_error(&target, e));
        }

        debug!(path = %path, bytes = bytes.len(), "Wrote blob");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                Self::io_error(&target, e)
            }
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| Self::io_error(&target, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(path)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-flight atomic writes
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn ensure_writable(&self) -> Result<(), StorageError> {
        let unavailable = |what: &str, e: std::io::Error| {
            StorageError::Unavailable(format!("{} {}: {}", what, self.root.display(), e))
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| unavailable("cannot create", e))?;

        let probe = self
            .root
            .join(format!(".bitvault-probe-{}", Uuid::new_v4().simple()));
        let payload = b"bitvault";
        tokio::fs::write(&probe, payload)
            .await
            .map_err(|e| unavailable("cannot write to", e))?;
        let read_back = tokio::fs::read(&probe).await;
        let _ = tokio::fs::remove_file(&probe).await;

        match read_back {
            Ok(bytes) if bytes == payload => Ok(()),
            Ok(_) => Err(StorageError::Unavailable(format!(
                "probe mismatch under {}",
                self.root.display()
            ))),
            Err(e) => Err(unavailable("cannot read from", e)),
        }
    }

    fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}
