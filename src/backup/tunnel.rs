//! Job-scoped SSH tunnel lifecycle.
//!
//! The [`TunnelManager`] wraps an injected [`TunnelProvider`] and tells
//! downstream consumers which host and port to dial, so dump clients and
//! connection testers never need to know whether a tunnel is in play.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::backup::connection::ConnectionConfig;
use crate::backup::job::{BackupJob, LogLevel};
use crate::backup::{BackupError, Result, TunnelError};

/// Default upper bound for establishing a tunnel
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Local address exposed by an active tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
}

/// Capability to open and close an SSH tunnel to a database server.
///
/// Implementations must hand out local ports that do not collide with other
/// active tunnels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `server` and return the local endpoint to dial
    async fn establish(&self, server: &ConnectionConfig) -> std::result::Result<TunnelEndpoint, TunnelError>;

    /// Whether a tunnel opened by this provider is still up
    async fn is_active(&self) -> bool;

    /// Tear the tunnel down
    async fn close(&self) -> std::result::Result<(), TunnelError>;
}

/// Creates a fresh provider for each job run
pub type TunnelProviderFactory = Arc<dyn Fn() -> Arc<dyn TunnelProvider> + Send + Sync>;

/// Owns the tunnel endpoint for one job run
pub struct TunnelManager {
    provider: Arc<dyn TunnelProvider>,
    endpoint: Option<TunnelEndpoint>,
    establish_timeout: Duration,
}

impl TunnelManager {
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self::with_timeout(provider, DEFAULT_ESTABLISH_TIMEOUT)
    }

    pub fn with_timeout(provider: Arc<dyn TunnelProvider>, establish_timeout: Duration) -> Self {
        Self {
            provider,
            endpoint: None,
            establish_timeout,
        }
    }

    /// Open the tunnel for `server` and record it in the job log.
    ///
    /// The log entry carries the local port and the SSH target without
    /// credentials.
    pub async fn establish(&mut self, server: &ConnectionConfig, job: &mut BackupJob) -> Result<TunnelEndpoint> {
        let Some(safe_ssh) = server.safe_ssh_config() else {
            return Err(BackupError::Configuration(format!(
                "SSH tunnel requested for server '{}' but no SSH configuration is present",
                server.server_name
            )));
        };

        let endpoint = tokio::time::timeout(self.establish_timeout, self.provider.establish(server))
            .await
            .map_err(|_| TunnelError::Timeout(self.establish_timeout))??;

        info!(
            server = %server.server_name,
            ssh_host = %safe_ssh.host,
            local_port = endpoint.port,
            "SSH tunnel established"
        );

        let mut context = Map::new();
        context.insert("local_host".to_string(), Value::String(endpoint.host.clone()));
        context.insert("local_port".to_string(), json!(endpoint.port));
        context.insert("ssh".to_string(), serde_json::to_value(&safe_ssh).unwrap_or(Value::Null));
        job.log_with_context(
            LogLevel::Info,
            format!(
                "SSH tunnel established via {}:{} on local port {}",
                safe_ssh.host, safe_ssh.port, endpoint.port
            ),
            Some(context),
        );

        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Close the tunnel if the provider still reports it active.
    ///
    /// Never fails: close errors become warning entries and the endpoint is
    /// cleared regardless.
    pub async fn close(&mut self, job: &mut BackupJob) {
        if self.provider.is_active().await {
            match self.provider.close().await {
                Ok(()) => {
                    info!("SSH tunnel closed");
                    job.log(LogLevel::Info, "SSH tunnel closed");
                }
                Err(err) => {
                    warn!(error = %err, "Failed to close SSH tunnel");
                    job.log(LogLevel::Warning, format!("Failed to close SSH tunnel: {err}"));
                }
            }
        }
        self.endpoint = None;
    }

    pub fn endpoint(&self) -> Option<&TunnelEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Host to dial for `server`: the tunnel when active, else the server itself
    pub fn connection_host<'a>(&'a self, server: &'a ConnectionConfig) -> &'a str {
        match &self.endpoint {
            Some(endpoint) => &endpoint.host,
            None => &server.host,
        }
    }

    pub fn connection_port(&self, server: &ConnectionConfig) -> u16 {
        match &self.endpoint {
            Some(endpoint) => endpoint.port,
            None => server.port,
        }
    }
}
