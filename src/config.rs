use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::ssh_tunnel::SshCommandTunnel;
use crate::backup::storage::presign::DEFAULT_EXPIRY_MINUTES;
use crate::backup::tunnel::{TunnelProvider, TunnelProviderFactory};
use crate::backup::{BackupError, Result};

/// Configuration for the backup broker service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// SQLite URL of the volume/snapshot catalog
    pub database_url: String,
    /// Address the HTTP server listens on
    pub bind_address: SocketAddr,
    /// Upper bound for opening an SSH tunnel
    pub tunnel_timeout: Duration,
    /// Validity of presigned download URLs
    pub presigned_url_expiry_minutes: u32,
    pub ssh_binary: PathBuf,
    pub sshpass_binary: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::from("sqlite:db.sqlite"),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tunnel_timeout: Duration::from_secs(30),
            presigned_url_expiry_minutes: DEFAULT_EXPIRY_MINUTES,
            ssh_binary: PathBuf::from("ssh"),
            sshpass_binary: PathBuf::from("sshpass"),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset or blank variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let database_url = var("DATABASE_URL").unwrap_or(defaults.database_url);

        let bind_address = match var("BIND_ADDRESS") {
            Some(value) => parse("BIND_ADDRESS", &value)?,
            None => defaults.bind_address,
        };

        let tunnel_timeout = match var("TUNNEL_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(parse("TUNNEL_TIMEOUT_SECS", &value)?),
            None => defaults.tunnel_timeout,
        };

        let presigned_url_expiry_minutes = match var("PRESIGNED_URL_EXPIRY_MINUTES") {
            Some(value) => parse("PRESIGNED_URL_EXPIRY_MINUTES", &value)?,
            None => defaults.presigned_url_expiry_minutes,
        };
        if presigned_url_expiry_minutes == 0 {
            return Err(BackupError::Configuration(
                "PRESIGNED_URL_EXPIRY_MINUTES must be at least 1".to_string(),
            ));
        }

        let ssh_binary = var("SSH_BINARY").map(PathBuf::from).unwrap_or(defaults.ssh_binary);
        let sshpass_binary = var("SSHPASS_BINARY").map(PathBuf::from).unwrap_or(defaults.sshpass_binary);

        Ok(Self {
            database_url,
            bind_address,
            tunnel_timeout,
            presigned_url_expiry_minutes,
            ssh_binary,
            sshpass_binary,
        })
    }

    /// Factory handing each job run its own `ssh` tunnel process
    pub fn tunnel_factory(&self) -> TunnelProviderFactory {
        let ssh_binary = self.ssh_binary.clone();
        let sshpass_binary = self.sshpass_binary.clone();
        let readiness_timeout = self.tunnel_timeout;
        Arc::new(move || -> Arc<dyn TunnelProvider> {
            Arc::new(SshCommandTunnel::new(
                ssh_binary.clone(),
                sshpass_binary.clone(),
                readiness_timeout,
            ))
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| BackupError::Configuration(format!("{} has invalid value '{}': {}", key, value, e)))
}
