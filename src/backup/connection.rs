//! Connection details for a database server, optionally behind an SSH bastion.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mysql,
    Mariadb,
    Postgresql,
    Sqlite,
    Mongodb,
}

impl DatabaseType {
    /// File-based engines are never reached over the network
    pub fn is_file_based(&self) -> bool {
        matches!(self, DatabaseType::Sqlite)
    }

    /// Extension used for dump artifacts of this engine
    pub fn dump_extension(&self) -> &'static str {
        match self {
            DatabaseType::Mysql | DatabaseType::Mariadb | DatabaseType::Postgresql => "sql.gz",
            DatabaseType::Sqlite => "db.gz",
            DatabaseType::Mongodb => "archive.gz",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mariadb => "mariadb",
            DatabaseType::Postgresql => "postgresql",
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Mongodb => "mongodb",
        };
        f.write_str(name)
    }
}

/// How the SSH bastion authenticates us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuthType {
    Password,
    PrivateKey,
}

/// Full SSH configuration, including credentials.
///
/// Only handed to the tunnel provider. Anything that gets logged goes
/// through [`SafeSshConfig`] instead.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_type: SshAuthType,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credential-free view of an [`SshConfig`] for audit logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeSshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: SshAuthType,
}

/// Everything needed to reach one database server
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub database_type: DatabaseType,
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ssh_config: Option<SshConfig>,
}

impl ConnectionConfig {
    /// SQLite is file-based and never tunneled, even with SSH data present.
    pub fn requires_ssh_tunnel(&self) -> bool {
        self.ssh_config.is_some() && !self.database_type.is_file_based()
    }

    /// SSH target without password, private key or passphrase
    pub fn safe_ssh_config(&self) -> Option<SafeSshConfig> {
        self.ssh_config.as_ref().map(|ssh| SafeSshConfig {
            host: ssh.host.clone(),
            port: ssh.port,
            username: ssh.username.clone(),
            auth_type: ssh.auth_type,
        })
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("database_type", &self.database_type)
            .field("server_name", &self.server_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssh_config", &self.ssh_config)
            .finish()
    }
}
