//! Storage backend trait

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Storage backend trait
///
/// Objects are addressed by opaque, slash-separated keys chosen by the
/// caller. Writing an existing key replaces its content.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Get the size of an object
    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    /// Read an object fully into memory
    async fn read(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Write an object, replacing any previous content
    async fn write(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Delete an object. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Backend name for logs and health output
    fn name(&self) -> &'static str;
}

/// Reject keys that are empty, absolute, or escape the storage root
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("maven/1/2/ab/cd/abcdef").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("maven/../../etc").is_err());
        assert!(validate_key("maven//x").is_err());
        assert!(validate_key("maven\\x").is_err());
    }
}
