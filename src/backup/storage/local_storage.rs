//! Local filesystem implementation of the StorageProvider trait
//!
//! Artifacts live under the volume root; every filename is validated as a
//! safe relative path before it is joined onto the root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::{debug, info};

use super::{LocalVolumeConfig, StorageProvider};
use crate::backup::path_safety::validate_relative;
use crate::backup::{BackupError, Result};

/// Provides local filesystem storage for backup artifacts
pub struct LocalStorageProvider {
    /// Base directory for stored artifacts
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(volume: &LocalVolumeConfig) -> Self {
        Self {
            root: volume.path.clone(),
        }
    }

    /// Full path for an artifact, rejecting traversal and absolute names
    pub fn artifact_path(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty() {
            return Err(BackupError::Validation("artifact filename must not be empty".to_string()));
        }
        validate_relative(filename)?;
        Ok(self.root.join(filename))
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    async fn store(&self, source: &Path, filename: &str) -> Result<()> {
        let dest_path = self.artifact_path(filename)?;

        if let Some(parent) = dest_path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        tokio_fs::copy(source, &dest_path).await?;
        info!(path = %dest_path.display(), "Stored artifact on local volume");
        Ok(())
    }

    async fn retrieve(&self, filename: &str, destination: &Path) -> Result<()> {
        let source_path = self.artifact_path(filename)?;

        if !tokio_fs::try_exists(&source_path).await? {
            return Err(BackupError::ArtifactNotFound(filename.to_string()));
        }

        if let Some(parent) = destination.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        tokio_fs::copy(&source_path, destination).await?;
        debug!(path = %source_path.display(), "Retrieved artifact from local volume");
        Ok(())
    }

    async fn exists(&self, filename: &str) -> Result<bool> {
        let path = self.artifact_path(filename)?;
        Ok(tokio_fs::try_exists(&path).await?)
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.artifact_path(filename)?;
        if tokio_fs::try_exists(&path).await? {
            tokio_fs::remove_file(&path).await?;
            info!(path = %path.display(), "Deleted artifact from local volume");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    // Helper function to create a test file with some content
    async fn create_test_file(path: &Path, content: &str) -> std::io::Result<()> {
        let mut file = tokio_fs::File::create(path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn provider(root: &Path) -> LocalStorageProvider {
        LocalStorageProvider::new(&LocalVolumeConfig {
            path: root.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_store_and_retrieve_artifact() {
        let temp_dir = tempdir().unwrap();
        let provider = provider(&temp_dir.path().join("volume"));

        let source_file = temp_dir.path().join("dump.sql.gz");
        create_test_file(&source_file, "test backup data").await.unwrap();

        let filename = "production/app/production_app_2025-06-01_143000_abc123.sql.gz";
        provider.store(&source_file, filename).await.unwrap();
        assert!(provider.exists(filename).await.unwrap());

        let retrieved_file = temp_dir.path().join("restore/retrieved.sql.gz");
        provider.retrieve(filename, &retrieved_file).await.unwrap();

        let content = tokio_fs::read_to_string(&retrieved_file).await.unwrap();
        assert_eq!(content, "test backup data");
    }

    #[tokio::test]
    async fn test_retrieve_missing_artifact() {
        let temp_dir = tempdir().unwrap();
        let provider = provider(temp_dir.path());

        let result = provider.retrieve("missing.sql.gz", &temp_dir.path().join("out")).await;
        assert!(matches!(result, Err(BackupError::ArtifactNotFound(name)) if name == "missing.sql.gz"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let provider = provider(temp_dir.path());
        let source_file = temp_dir.path().join("dump");
        create_test_file(&source_file, "x").await.unwrap();

        provider.store(&source_file, "a/dump.sql.gz").await.unwrap();
        provider.delete("a/dump.sql.gz").await.unwrap();
        assert!(!provider.exists("a/dump.sql.gz").await.unwrap());
        provider.delete("a/dump.sql.gz").await.unwrap();
    }

    #[tokio::test]
    async fn test_unsafe_filenames_never_touch_disk() {
        let temp_dir = tempdir().unwrap();
        let provider = provider(&temp_dir.path().join("volume"));
        let source_file = temp_dir.path().join("dump");
        create_test_file(&source_file, "x").await.unwrap();

        for filename in ["../escape.sql", "/etc/passwd", "a\\b.sql"] {
            let result = provider.store(&source_file, filename).await;
            assert!(matches!(result, Err(BackupError::UnsafePath(_))), "{filename}");
        }
        assert!(matches!(
            provider.artifact_path(""),
            Err(BackupError::Validation(_))
        ));
        assert!(!temp_dir.path().join("escape.sql").exists());
    }
}
