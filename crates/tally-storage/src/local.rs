use crate::keys::{blob_key, rebase_key, BlobArea};
use crate::traits::{BlobStore, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Local filesystem blob storage
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path` (e.g. "/var/lib/tally/blobs").
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage { base_path })
    }

    /// Convert a storage key to a filesystem path, refusing keys that escape the root.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        if storage_key.is_empty() || storage_key.contains("..") || storage_key.starts_with('/') {
            return Err(StorageError::InvalidKey(
                "Storage key contains invalid characters".to_string(),
            ));
        }
        if storage_key.contains('\\') || storage_key.contains('\0') {
            return Err(StorageError::InvalidKey(
                "Storage key contains invalid characters".to_string(),
            ));
        }

        let path = self.base_path.join(storage_key);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        if let Ok(canonical) = path.canonicalize() {
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write through a temporary file and rename so readers never see partial blobs.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.ensure_parent_dir(path).await?;

        let tmp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await.map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to create file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        file.write_all(data).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to write file {}: {}", tmp_path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to sync file {}: {}", tmp_path.display(), e))
        })?;

        fs::rename(&tmp_path, path).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to finalize file {}: {}", path.display(), e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put(
        &self,
        area: BlobArea,
        tenant_id: Uuid,
        content_hash: &str,
        media_type: &str,
        data: &[u8],
    ) -> StorageResult<String> {
        if content_hash.len() < 2 || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidKey(format!(
                "Content hash is not hex: {}",
                content_hash
            )));
        }

        let key = blob_key(area, tenant_id, content_hash, media_type);
        let path = self.key_to_path(&key)?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(key = %key, "Blob already stored, skipping write");
            return Ok(key);
        }

        let start = std::time::Instant::now();
        self.write_atomic(&path, data).await?;

        tracing::info!(
            key = %key,
            area = area.prefix(),
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local blob write successful"
        );

        Ok(key)
    }

    async fn get(&self, storage_ref: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_ref)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(storage_ref.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::ReadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::debug!(key = %storage_ref, size_bytes = data.len(), "Local blob read successful");

        Ok(data)
    }

    async fn exists(&self, storage_ref: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_ref)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn copy_to(&self, storage_ref: &str, area: BlobArea) -> StorageResult<String> {
        let to_key = rebase_key(storage_ref, area)
            .ok_or_else(|| StorageError::InvalidKey(storage_ref.to_string()))?;
        if to_key == storage_ref {
            return Ok(to_key);
        }

        let from_path = self.key_to_path(storage_ref)?;
        let to_path = self.key_to_path(&to_key)?;

        if !fs::try_exists(&from_path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(storage_ref.to_string()));
        }
        if fs::try_exists(&to_path).await.unwrap_or(false) {
            return Ok(to_key);
        }

        let data = fs::read(&from_path).await.map_err(|e| {
            StorageError::ReadFailed(format!("Failed to read file {}: {}", from_path.display(), e))
        })?;
        self.write_atomic(&to_path, &data).await?;

        tracing::info!(
            from_key = %storage_ref,
            to_key = %to_key,
            "Local blob copy successful"
        );

        Ok(to_key)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
