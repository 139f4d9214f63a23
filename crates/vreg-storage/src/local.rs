//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::backend::{StorageBackend, validate_key};
use crate::error::StorageError;

/// Local disk storage backend
///
/// Each key maps to a file under `<base_path>/objects/<key>`.
pub struct LocalStorage {
    objects_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let objects_path = base_path.join("objects");

        fs::create_dir_all(&objects_path).await?;

        info!("Initialized local storage at {:?}", base_path);

        Ok(Self { objects_path })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.objects_path.join(key))
    }
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(metadata.len())
    }

    async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(key)?;
        debug!("Reading object from {:?}", path);

        let data = fs::read(&path).await.map_err(|e| not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        debug!("Writing {} bytes to {:?}", data.len(), path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Concurrent writers to one key each get their own temp file; the
        // last rename wins.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!("{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        fs::write(&temp_path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        debug!("Deleting object at {:?}", path);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        let key = "maven/1/2/ab/cd/abcd";

        assert!(!storage.exists(key).await.unwrap());
        storage.write(key, Bytes::from_static(b"hello")).await.unwrap();
        assert!(storage.exists(key).await.unwrap());
        assert_eq!(storage.size(key).await.unwrap(), 5);
        assert_eq!(storage.read(key).await.unwrap(), Bytes::from_static(b"hello"));

        // Overwrite replaces content
        storage.write(key, Bytes::from_static(b"bye")).await.unwrap();
        assert_eq!(storage.read(key).await.unwrap(), Bytes::from_static(b"bye"));

        assert!(storage.delete(key).await.unwrap());
        assert!(!storage.delete(key).await.unwrap());
        assert!(matches!(
            storage.read(key).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();

        let result = storage
            .write("../outside", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }
}
