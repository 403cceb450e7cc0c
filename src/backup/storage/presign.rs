//! Time-limited download URLs for artifacts in S3-compatible storage.
//!
//! URLs are signed against the volume's internal endpoint. When a
//! `public_endpoint` is configured, the scheme and authority are swapped for
//! the public one and the path and query (signature included) are kept
//! byte for byte. That only verifies on backends which do not bind the
//! signature to the Host header they receive, so check the target backend
//! before relying on it.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use tracing::{debug, error};
use url::{Position, Url};

use super::S3VolumeConfig;
use super::s3_storage::{S3ClientFactory, non_empty};
use crate::backup::{BackupError, Result};

/// Validity of a download URL when the caller does not choose one
pub const DEFAULT_EXPIRY_MINUTES: u32 = 15;

/// Signs retrieval URLs for artifacts on S3 volumes
pub struct ObjectStorageAdapter {
    clients: Arc<S3ClientFactory>,
}

impl ObjectStorageAdapter {
    pub fn new(clients: Arc<S3ClientFactory>) -> Self {
        Self { clients }
    }

    /// Presigned GET URL for `object_key` (relative to the volume prefix)
    pub async fn presigned_url(&self, volume: &S3VolumeConfig, object_key: &str, expires_in_minutes: u32) -> Result<String> {
        if expires_in_minutes == 0 {
            return Err(BackupError::Validation("presigned URL expiry must be at least one minute".to_string()));
        }
        volume.validate()?;
        let bucket = volume.bucket()?;
        let key = volume.object_key(object_key);
        let expires_in = Duration::from_secs(u64::from(expires_in_minutes) * 60);

        let client = self.clients.client_for(volume).await?;
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| BackupError::Storage(format!("Failed to create presigned URL config: {}", e)))?;

        let request = client
            .get_object()
            .bucket(bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| {
                error!(
                    bucket = %bucket,
                    key = %key,
                    error = %DisplayErrorContext(&e),
                    "Failed to generate presigned URL"
                );
                BackupError::Storage(format!("Failed to generate presigned URL: {}", DisplayErrorContext(&e)))
            })?;

        let signed = request.uri().to_string();
        debug!(bucket = %bucket, key = %key, expires_in_minutes, "Generated presigned URL");

        match non_empty(&volume.public_endpoint) {
            Some(public) => rewrite_origin(&signed, public),
            None => Ok(signed),
        }
    }
}

/// Replace scheme, host and port of `signed` with those of `public_endpoint`
pub fn rewrite_origin(signed: &str, public_endpoint: &str) -> Result<String> {
    let signed_url = Url::parse(signed)
        .map_err(|e| BackupError::Storage(format!("Signed URL is not a valid URL: {}", e)))?;
    let public = Url::parse(public_endpoint)
        .map_err(|e| BackupError::Configuration(format!("Invalid public_endpoint '{}': {}", public_endpoint, e)))?;

    if !matches!(public.scheme(), "http" | "https") || public.host_str().is_none() {
        return Err(BackupError::Configuration(format!(
            "public_endpoint '{}' must be an http(s) URL with a host",
            public_endpoint
        )));
    }

    Ok(format!(
        "{}{}",
        public.origin().ascii_serialization(),
        &signed_url[Position::BeforePath..]
    ))
}
