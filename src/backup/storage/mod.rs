//! Storage volumes for backup artifacts
//!
//! A volume is either a directory on the local filesystem or a bucket in
//! S3-compatible object storage. Volumes are stored as a `type` plus a JSON
//! configuration blob and turned into a [`StorageProvider`] on demand.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backup::path_safety::{validate_path, validate_relative};
use crate::backup::{BackupError, Result};

pub mod credentials;
pub mod local_storage;
pub mod presign;
pub mod s3_storage;

use self::local_storage::LocalStorageProvider;
use self::presign::ObjectStorageAdapter;
use self::s3_storage::{S3ClientFactory, S3StorageProvider, non_empty};

const DEFAULT_REGION: &str = "us-east-1";

/// Root directory of a local volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolumeConfig {
    pub path: PathBuf,
}

/// Bucket settings of an S3-compatible volume; every field is optional
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3VolumeConfig {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub custom_endpoint: Option<String>,
    pub public_endpoint: Option<String>,
    pub use_path_style_endpoint: bool,
    pub custom_role_arn: Option<String>,
    pub role_session_name: Option<String>,
    pub sts_endpoint: Option<String>,
}

impl S3VolumeConfig {
    pub fn region(&self) -> &str {
        non_empty(&self.region).unwrap_or(DEFAULT_REGION)
    }

    pub fn bucket(&self) -> Result<&str> {
        non_empty(&self.bucket)
            .ok_or_else(|| BackupError::Configuration("S3 volume has no bucket configured".to_string()))
    }

    /// Full object key: `prefix/key` when a prefix is set, else `key`
    pub fn object_key(&self, key: &str) -> String {
        match non_empty(&self.prefix) {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(self.prefix.as_deref(), false)?;
        // Virtual-hosted URLs carry the bucket in the host, which the
        // public endpoint rewrite replaces
        if non_empty(&self.public_endpoint).is_some() && !self.use_path_style_endpoint {
            return Err(BackupError::Configuration(
                "public_endpoint requires use_path_style_endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for S3VolumeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3VolumeConfig")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("custom_endpoint", &self.custom_endpoint)
            .field("public_endpoint", &self.public_endpoint)
            .field("use_path_style_endpoint", &self.use_path_style_endpoint)
            .field("custom_role_arn", &self.custom_role_arn)
            .field("role_session_name", &self.role_session_name)
            .field("sts_endpoint", &self.sts_endpoint)
            .finish()
    }
}

/// Configuration of one storage volume, tagged by its `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageVolumeConfig {
    Local(LocalVolumeConfig),
    S3(S3VolumeConfig),
}

impl StorageVolumeConfig {
    /// Build from the persisted `type` column and JSON configuration
    pub fn from_parts(kind: &str, config: serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| BackupError::Validation(format!("invalid {} volume configuration: {}", kind, e));
        match kind {
            "local" => Ok(Self::Local(serde_json::from_value(config).map_err(invalid)?)),
            "s3" => Ok(Self::S3(serde_json::from_value(config).map_err(invalid)?)),
            other => Err(BackupError::UnsupportedStorageType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
        }
    }

    /// Configuration without the `type` tag, as stored alongside it
    pub fn config_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Local(local) => serde_json::to_value(local),
            Self::S3(s3) => serde_json::to_value(s3),
        };
        value.map_err(|e| BackupError::Validation(format!("volume configuration is not serializable: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Local(local) => {
                let root = local.path.to_str().ok_or_else(|| {
                    BackupError::Validation(format!("local volume path {} is not valid UTF-8", local.path.display()))
                })?;
                if root.trim().is_empty() {
                    return Err(BackupError::Validation("local volume path must not be empty".to_string()));
                }
                validate_path(Some(root), true)?;
                Ok(())
            }
            Self::S3(s3) => s3.validate(),
        }
    }
}

/// A stored artifact and the volume holding it
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: i64,
    pub volume: StorageVolumeConfig,
    pub filename: String,
    pub database_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Backend holding backup artifacts, addressed by relative filename
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Copy the file at `source` into the volume as `filename`
    async fn store(&self, source: &Path, filename: &str) -> Result<()>;

    /// Copy `filename` out of the volume to `destination`
    async fn retrieve(&self, filename: &str, destination: &Path) -> Result<()>;

    async fn exists(&self, filename: &str) -> Result<bool>;

    /// Remove `filename`; removing a missing artifact is not an error
    async fn delete(&self, filename: &str) -> Result<()>;
}

/// Create the provider matching the volume's type
pub async fn create_storage_provider(
    volume: &StorageVolumeConfig,
    clients: &S3ClientFactory,
) -> Result<Box<dyn StorageProvider>> {
    volume.validate()?;
    match volume {
        StorageVolumeConfig::Local(local) => Ok(Box::new(LocalStorageProvider::new(local))),
        StorageVolumeConfig::S3(s3) => Ok(Box::new(S3StorageProvider::new(s3, clients).await?)),
    }
}

/// Where a caller fetches an artifact from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    /// Presigned URL to redirect to
    Redirect(String),
    /// File on a local volume to stream
    LocalFile(PathBuf),
}

/// Resolve how the artifact of `snapshot` can be downloaded
pub async fn resolve_artifact(
    snapshot: &Snapshot,
    adapter: &ObjectStorageAdapter,
    expires_in_minutes: u32,
) -> Result<ArtifactLocation> {
    validate_relative(&snapshot.filename)?;
    match &snapshot.volume {
        StorageVolumeConfig::S3(s3) => {
            s3.validate()?;
            let url = adapter.presigned_url(s3, &snapshot.filename, expires_in_minutes).await?;
            Ok(ArtifactLocation::Redirect(url))
        }
        StorageVolumeConfig::Local(local) => {
            let path = LocalStorageProvider::new(local).artifact_path(&snapshot.filename)?;
            if !tokio::fs::try_exists(&path).await? {
                return Err(BackupError::ArtifactNotFound(snapshot.filename.clone()));
            }
            Ok(ArtifactLocation::LocalFile(path))
        }
    }
}
