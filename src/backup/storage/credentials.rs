//! Short-lived credentials obtained by assuming an IAM role through STS.
//!
//! Temporary credentials are cached per role request and refreshed only
//! once they come within [`REFRESH_WINDOW_SECS`] of expiring.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_sts::error::DisplayErrorContext;
use aws_types::region::Region;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::backup::{BackupError, Result};

/// Remaining validity, in seconds, below which cached credentials are refreshed
pub const REFRESH_WINDOW_SECS: i64 = 300;

/// Session name used when a volume does not configure one
pub const DEFAULT_SESSION_NAME: &str = "backup-broker";

/// Requested lifetime of assumed-role credentials
const ASSUMED_ROLE_DURATION_SECS: i32 = 3600;

/// Everything that identifies one assume-role call
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub region: String,
    pub sts_endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for AssumeRoleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumeRoleRequest")
            .field("role_arn", &self.role_arn)
            .field("session_name", &self.session_name)
            .field("region", &self.region)
            .field("sts_endpoint", &self.sts_endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Credentials returned by STS
#[derive(Clone, PartialEq, Eq)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TemporaryCredentials {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= Duration::seconds(REFRESH_WINDOW_SECS)
    }

    /// Convert into SDK credentials usable for signing
    pub fn to_sdk_credentials(&self) -> Credentials {
        Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            Some(self.session_token.clone()),
            Some(self.expires_at.into()),
            "AssumedRole",
        )
    }
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Exchanges long-lived keys for temporary role credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<TemporaryCredentials>;
}

/// [`RoleAssumer`] that calls the STS `AssumeRole` API
#[derive(Debug, Default, Clone)]
pub struct StsRoleAssumer;

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<TemporaryCredentials> {
        let seed = Credentials::new(
            request.access_key_id.clone(),
            request.secret_access_key.clone(),
            None,
            None,
            "VolumeStaticCredentials",
        );

        let mut builder = aws_sdk_sts::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(request.region.clone()))
            .credentials_provider(seed);
        if let Some(endpoint) = &request.sts_endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = aws_sdk_sts::Client::from_conf(builder.build());

        debug!(role_arn = %request.role_arn, session = %request.session_name, "Assuming role");
        let output = client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .duration_seconds(ASSUMED_ROLE_DURATION_SECS)
            .send()
            .await
            .map_err(|err| {
                error!(role_arn = %request.role_arn, error = %DisplayErrorContext(&err), "Failed to assume role");
                BackupError::Storage(format!(
                    "failed to assume role {}: {}",
                    request.role_arn,
                    DisplayErrorContext(&err)
                ))
            })?;

        let credentials = output.credentials().ok_or_else(|| {
            BackupError::Storage(format!("assume role {} returned no credentials", request.role_arn))
        })?;
        let expires_at = DateTime::from_timestamp(credentials.expiration().secs(), 0).ok_or_else(|| {
            BackupError::Storage(format!("assume role {} returned an invalid expiration", request.role_arn))
        })?;

        Ok(TemporaryCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expires_at,
        })
    }
}

/// Cache of assumed-role credentials shared across requests
pub struct AssumedRoleCache {
    assumer: Arc<dyn RoleAssumer>,
    entries: Mutex<HashMap<AssumeRoleRequest, TemporaryCredentials>>,
}

impl AssumedRoleCache {
    pub fn new(assumer: Arc<dyn RoleAssumer>) -> Self {
        Self {
            assumer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached credentials for `request`, assuming the role again only when
    /// missing or close to expiry.
    pub async fn credentials(&self, request: &AssumeRoleRequest) -> Result<TemporaryCredentials> {
        // Held across the STS call so concurrent callers share one refresh
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(request) {
            if !cached.needs_refresh(Utc::now()) {
                return Ok(cached.clone());
            }
            debug!(role_arn = %request.role_arn, expires_at = %cached.expires_at, "Refreshing assumed-role credentials");
        }

        let fresh = self.assumer.assume_role(request).await?;
        info!(role_arn = %request.role_arn, expires_at = %fresh.expires_at, "Obtained assumed-role credentials");
        entries.insert(request.clone(), fresh.clone());
        Ok(fresh)
    }
}
