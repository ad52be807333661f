//! Blob storage capability used to persist credential material.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::utils::BrokerError;

/// Abstract file-like storage.
///
/// Implementations map a missing file on `read` to [`BrokerError::NotFoundError`]
/// and any other failure to [`BrokerError::StorageError`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `data` to `path`, replacing any existing content.
    async fn save(&self, path: &Path, data: &[u8]) -> Result<PathBuf, BrokerError>;

    /// Reads the full content stored at `path`.
    async fn read(&self, path: &Path) -> Result<Vec<u8>, BrokerError>;

    /// Returns whether `path` references an existing blob.
    async fn exists(&self, path: &Path) -> bool;

    /// Deletes the blob at `path`.
    async fn delete(&self, path: &Path) -> Result<(), BrokerError>;

    /// Copies the blob at `src` to `dst`.
    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), BrokerError>;
}

/// Filesystem-backed blob store.
///
/// Files are created with mode `0600` on Unix since they usually hold private keys.
#[derive(Debug, Clone, Default)]
pub struct FsBlobStore;

impl FsBlobStore {
    pub fn new() -> Self {
        Self
    }

    /// Returns a path inside `dir` whose file name is a fresh UUID.
    pub fn unique_path(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(Uuid::new_v4().to_string())
    }
}

fn map_io(path: &Path, err: std::io::Error) -> BrokerError {
    if err.kind() == ErrorKind::NotFound {
        BrokerError::NotFoundError(path.to_path_buf())
    } else {
        BrokerError::storage(path, err)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, path: &Path, data: &[u8]) -> Result<PathBuf, BrokerError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(path)
            .await
            .map_err(|e| BrokerError::storage(path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| BrokerError::storage(path, e))?;
        file.flush().await.map_err(|e| BrokerError::storage(path, e))?;

        Ok(path.to_path_buf())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, BrokerError> {
        tokio::fs::read(path).await.map_err(|e| map_io(path, e))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn delete(&self, path: &Path) -> Result<(), BrokerError> {
        tokio::fs::remove_file(path).await.map_err(|e| map_io(path, e))
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), BrokerError> {
        tokio::fs::copy(src, dst)
            .await
            .map(|_| ())
            .map_err(|e| map_io(src, e))
    }
}

/// In-memory blob store, handy for tests and ephemeral brokers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<PathBuf, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, path: &Path, data: &[u8]) -> Result<PathBuf, BrokerError> {
        self.blobs.insert(path.to_path_buf(), data.to_vec());
        Ok(path.to_path_buf())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, BrokerError> {
        self.blobs
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFoundError(path.to_path_buf()))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.blobs.contains_key(path)
    }

    async fn delete(&self, path: &Path) -> Result<(), BrokerError> {
        self.blobs
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFoundError(path.to_path_buf()))
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), BrokerError> {
        let data = self.read(src).await?;
        self.blobs.insert(dst.to_path_buf(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_saves_reads_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new();
        let path = FsBlobStore::unique_path(dir.path());

        store.save(&path, b"secret").await.unwrap();
        assert!(store.exists(&path).await);
        assert_eq!(store.read(&path).await.unwrap(), b"secret");

        let copy = dir.path().join("copy");
        store.copy(&path, &copy).await.unwrap();
        assert_eq!(store.read(&copy).await.unwrap(), b"secret");

        store.delete(&path).await.unwrap();
        assert!(!store.exists(&path).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fs_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        FsBlobStore::new().save(&path, b"k").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn missing_files_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let fs = FsBlobStore::new();
        assert!(matches!(fs.read(&missing).await, Err(BrokerError::NotFoundError(_))));
        assert!(matches!(fs.delete(&missing).await, Err(BrokerError::NotFoundError(_))));

        let mem = MemoryBlobStore::new();
        assert!(matches!(mem.read(&missing).await, Err(BrokerError::NotFoundError(_))));
    }

    #[tokio::test]
    async fn save_into_missing_directory_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("key");

        let err = FsBlobStore::new().save(&path, b"k").await.unwrap_err();
        assert!(matches!(err, BrokerError::StorageError { .. }));
    }
}
