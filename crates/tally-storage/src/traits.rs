//! Blob storage abstraction

use async_trait::async_trait;
use tally_core::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::keys::BlobArea;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("Blob not found: {}", key)),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            other => AppError::UpstreamUnavailable {
                service: "blob storage".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Content-addressable blob storage.
///
/// `put` returns a storage reference that `get` accepts. Bytes are never deleted
/// by the engine; quarantined rejects stay retrievable until a reviewer acts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under their content address and return the storage reference.
    async fn put(
        &self,
        area: BlobArea,
        tenant_id: Uuid,
        content_hash: &str,
        media_type: &str,
        data: &[u8],
    ) -> StorageResult<String>;

    /// Read bytes by storage reference
    async fn get(&self, storage_ref: &str) -> StorageResult<Vec<u8>>;

    async fn exists(&self, storage_ref: &str) -> StorageResult<bool>;

    /// Copy a blob into another area and return the new reference. The source is kept.
    async fn copy_to(&self, storage_ref: &str, area: BlobArea) -> StorageResult<String>;

    fn backend_name(&self) -> &'static str;
}
