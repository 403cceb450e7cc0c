//! S3-compatible implementation of the StorageProvider trait
//!
//! Works against AWS S3 as well as MinIO-style endpoints. Clients are
//! built per volume by [`S3ClientFactory`], which decides how requests are
//! signed: static keys, assumed-role credentials, or the default AWS
//! credential chain.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_types::region::Region;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::credentials::{AssumeRoleRequest, AssumedRoleCache, DEFAULT_SESSION_NAME, RoleAssumer, StsRoleAssumer};
use super::{S3VolumeConfig, StorageProvider};
use crate::backup::path_safety::validate_relative;
use crate::backup::{BackupError, Result};

/// Builds S3 clients for storage volumes
pub struct S3ClientFactory {
    assumed_roles: AssumedRoleCache,
}

impl Default for S3ClientFactory {
    fn default() -> Self {
        Self::new(Arc::new(StsRoleAssumer))
    }
}

impl S3ClientFactory {
    pub fn new(assumer: Arc<dyn RoleAssumer>) -> Self {
        Self {
            assumed_roles: AssumedRoleCache::new(assumer),
        }
    }

    /// Credentials used to sign requests for `volume`.
    ///
    /// `None` means the default AWS credential chain applies.
    pub async fn signing_credentials(&self, volume: &S3VolumeConfig) -> Result<Option<Credentials>> {
        let static_keys = match (non_empty(&volume.access_key_id), non_empty(&volume.secret_access_key)) {
            (Some(key), Some(secret)) => Some((key, secret)),
            _ => None,
        };

        let Some(role_arn) = non_empty(&volume.custom_role_arn) else {
            return Ok(static_keys.map(|(key, secret)| {
                Credentials::new(key, secret, None, None, "VolumeStaticCredentials")
            }));
        };

        let Some((key, secret)) = static_keys else {
            return Err(BackupError::Configuration(
                "custom_role_arn requires access_key_id and secret_access_key".to_string(),
            ));
        };

        let request = AssumeRoleRequest {
            role_arn: role_arn.to_string(),
            session_name: non_empty(&volume.role_session_name)
                .unwrap_or(DEFAULT_SESSION_NAME)
                .to_string(),
            region: volume.region().to_string(),
            sts_endpoint: non_empty(&volume.sts_endpoint).map(str::to_string),
            access_key_id: key.to_string(),
            secret_access_key: secret.to_string(),
        };
        let temporary = self.assumed_roles.credentials(&request).await?;
        Ok(Some(temporary.to_sdk_credentials()))
    }

    /// Client addressed at the volume's custom endpoint, or the regional
    /// AWS endpoint when none is set.
    pub async fn client_for(&self, volume: &S3VolumeConfig) -> Result<S3Client> {
        let region = Region::new(volume.region().to_string());

        let mut builder = match self.signing_credentials(volume).await? {
            Some(credentials) => aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(credentials),
            None => {
                let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&sdk_config)
            }
        };

        if let Some(endpoint) = non_empty(&volume.custom_endpoint) {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(volume.use_path_style_endpoint);

        Ok(S3Client::from_conf(builder.build()))
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Provides S3 storage for backup artifacts
pub struct S3StorageProvider {
    client: S3Client,
    volume: S3VolumeConfig,
    bucket: String,
}

impl S3StorageProvider {
    pub async fn new(volume: &S3VolumeConfig, clients: &S3ClientFactory) -> Result<Self> {
        volume.validate()?;
        let bucket = volume.bucket()?.to_string();
        let client = clients.client_for(volume).await?;
        Ok(Self {
            client,
            volume: volume.clone(),
            bucket,
        })
    }

    fn key_for(&self, filename: &str) -> Result<String> {
        validate_relative(filename)?;
        Ok(self.volume.object_key(filename))
    }

    /// Map AWS S3 errors to BackupError
    fn map_s3_error<E>(&self, error: SdkError<E>, operation: &str, filename: &str) -> BackupError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(service_err) = &error {
            if service_err.raw().status().as_u16() == 404 {
                return BackupError::ArtifactNotFound(filename.to_string());
            }
        }
        error!(
            bucket = %self.bucket,
            operation,
            error = %DisplayErrorContext(&error),
            "S3 request failed"
        );
        BackupError::Storage(format!(
            "S3 {} failed for {}: {}",
            operation,
            filename,
            DisplayErrorContext(&error)
        ))
    }
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    async fn store(&self, source: &Path, filename: &str) -> Result<()> {
        let key = self.key_for(filename)?;
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| BackupError::Storage(format!("Failed to read {}: {}", source.display(), e)))?;

        debug!(bucket = %self.bucket, key = %key, "Uploading artifact");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_s3_error(e, "put_object", filename))?;

        info!(bucket = %self.bucket, key = %key, "Uploaded artifact to S3");
        Ok(())
    }

    async fn retrieve(&self, filename: &str, destination: &Path) -> Result<()> {
        let key = self.key_for(filename)?;

        debug!(bucket = %self.bucket, key = %key, "Downloading artifact");
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.map_s3_error(e, "get_object", filename))?;

        if let Some(parent) = destination.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        // Stream to disk; dumps can be far larger than memory
        let mut body = resp.body.into_async_read();
        let mut file = tokio_fs::File::create(destination).await?;
        let copied = match tokio::io::copy(&mut body, &mut file).await {
            Ok(copied) => copied,
            Err(e) => {
                drop(file);
                let _ = tokio_fs::remove_file(destination).await;
                return Err(BackupError::Storage(format!("Failed to stream S3 object {}: {}", key, e)));
            }
        };
        file.flush().await?;

        info!(bucket = %self.bucket, key = %key, bytes = copied, "Downloaded artifact from S3");
        Ok(())
    }

    async fn exists(&self, filename: &str) -> Result<bool> {
        let key = self.key_for(filename)?;
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(err) => match self.map_s3_error(err, "head_object", filename) {
                BackupError::ArtifactNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        let key = self.key_for(filename)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.map_s3_error(e, "delete_object", filename))?;
        info!(bucket = %self.bucket, key = %key, "Deleted artifact from S3");
        Ok(())
    }
}
