//! Archive Store
//!
//! Places uploaded (still encrypted) report archives in durable storage.
//! Each archive gets a fresh `{uuid}.zip` name; the returned location is what
//! the upload record points at.

use std::path::PathBuf;
use uuid::Uuid;

use super::S3Client;
use crate::conversation::ProtocolError;

// ============================================================================
// Archive Store Trait
// ============================================================================

/// Trait for archive storage backends
#[async_trait::async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store `data` and return its location
    async fn persist(&self, data: &[u8]) -> Result<String, ProtocolError>;

    /// Remove an archive stored by `persist`
    async fn discard(&self, location: &str) -> Result<(), ProtocolError>;
}

fn archive_name() -> String {
    format!("{}.zip", Uuid::new_v4())
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem archive storage
pub struct LocalArchiveStore {
    base_path: PathBuf,
}

impl LocalArchiveStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

#[async_trait::async_trait]
impl ArchiveStore for LocalArchiveStore {
    async fn persist(&self, data: &[u8]) -> Result<String, ProtocolError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;

        let path = self.base_path.join(archive_name());

        // Write under a temporary name so a crash never leaves a truncated archive
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, data)
            .await
            .map_err(|e| ProtocolError::Storage(format!("Failed to write archive: {}", e)))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| ProtocolError::Storage(format!("Failed to move archive: {}", e)))?;

        Ok(path.to_string_lossy().to_string())
    }

    async fn discard(&self, location: &str) -> Result<(), ProtocolError> {
        let path = PathBuf::from(location);
        if !path.starts_with(&self.base_path) {
            return Err(ProtocolError::Storage(format!(
                "refusing to delete {} outside archive directory",
                location
            )));
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProtocolError::Storage(e.to_string())),
        }
    }
}

// ============================================================================
// S3 Storage
// ============================================================================

/// S3-based archive storage
pub struct S3ArchiveStore {
    client: S3Client,
    prefix: String,
}

impl S3ArchiveStore {
    pub fn new(client: S3Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn archive_key(&self) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), archive_name())
    }
}

#[async_trait::async_trait]
impl ArchiveStore for S3ArchiveStore {
    async fn persist(&self, data: &[u8]) -> Result<String, ProtocolError> {
        let key = self.archive_key();

        self.client
            .upload_archive(&key, data.to_vec())
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))?;

        Ok(format!("s3://{}/{}", self.client.bucket(), key))
    }

    async fn discard(&self, location: &str) -> Result<(), ProtocolError> {
        let prefix = format!("s3://{}/", self.client.bucket());
        let key = location
            .strip_prefix(&prefix)
            .ok_or_else(|| ProtocolError::Storage(format!("not an archive location: {}", location)))?;

        self.client
            .remove_archive(key)
            .await
            .map_err(|e| ProtocolError::Storage(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_persist_and_discard() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::new(temp_dir.path().join("archives"));

        let location = store.persist(b"encrypted bytes").await.unwrap();
        assert!(location.ends_with(".zip"));
        assert_eq!(tokio::fs::read(&location).await.unwrap(), b"encrypted bytes");

        store.discard(&location).await.unwrap();
        assert!(!std::path::Path::new(&location).exists());

        // Discarding twice is fine
        store.discard(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_discard_outside_base() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::new(temp_dir.path().join("archives"));

        let result = store.discard("/etc/passwd").await;
        assert!(matches!(result, Err(ProtocolError::Storage(_))));
    }
}
