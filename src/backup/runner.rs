//! Backup and restore job execution
//!
//! A run validates its request before touching anything external, opens an
//! SSH tunnel when the server needs one, drives the injected
//! [`DumpExecutor`] against the effective host and port, moves artifacts
//! through a [`StorageProvider`] and always closes the tunnel at the end.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;
use tracing::{error, info, warn};

use crate::backup::connection::{ConnectionConfig, DatabaseType};
use crate::backup::job::{BackupJob, CommandUpdate, LogLevel};
use crate::backup::naming::SnapshotNaming;
use crate::backup::path_safety::validate_relative;
use crate::backup::selector::{filter_by_pattern, is_valid_pattern};
use crate::backup::storage::StorageProvider;
use crate::backup::tunnel::{DEFAULT_ESTABLISH_TIMEOUT, TunnelManager, TunnelProviderFactory};
use crate::backup::{BackupError, Result};

/// Resolved connection details handed to the dump process
#[derive(Clone)]
pub struct DumpTarget {
    pub database_type: DatabaseType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// `None` when listing databases on the server
    pub database: Option<String>,
}

impl DumpTarget {
    fn resolve(server: &ConnectionConfig, tunnel: &TunnelManager) -> Self {
        Self {
            database_type: server.database_type,
            host: tunnel.connection_host(server).to_string(),
            port: tunnel.connection_port(server),
            username: server.username.clone(),
            password: server.password.clone(),
            database: None,
        }
    }

    fn with_database(&self, database: &str) -> Self {
        Self {
            database: Some(database.to_string()),
            ..self.clone()
        }
    }
}

impl fmt::Debug for DumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpTarget")
            .field("database_type", &self.database_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Result of one external dump or restore process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Command line with credentials removed
    pub command: String,
    pub output: Option<String>,
    pub exit_code: i32,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Database-specific client processes (mysqldump, pg_dump, mongodump, ...)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DumpExecutor: Send + Sync {
    /// Names of all user databases reachable through `target`
    async fn list_databases(&self, target: &DumpTarget) -> Result<Vec<String>>;

    /// Dump `target.database` into the file at `destination`
    async fn dump(&self, target: &DumpTarget, destination: &Path) -> Result<CommandOutcome>;

    /// Command line `restore` will run, without credentials
    fn restore_command(&self, target: &DumpTarget, source: &Path) -> String;

    /// Load the dump at `source` into `target.database`
    async fn restore(&self, target: &DumpTarget, source: &Path) -> Result<CommandOutcome>;
}

/// Which databases of a server a backup covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseSelection {
    All,
    Named(Vec<String>),
    /// Case-insensitive regular expression, see [`filter_by_pattern`]
    Pattern(String),
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub server: ConnectionConfig,
    pub selection: DatabaseSelection,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub server: ConnectionConfig,
    pub database: String,
    /// Artifact filename relative to the storage volume
    pub filename: String,
}

/// An artifact written by a backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub database: String,
    pub filename: String,
    pub size_bytes: u64,
}

/// Executes backup and restore jobs
pub struct BackupRunner {
    tunnels: TunnelProviderFactory,
    executor: Arc<dyn DumpExecutor>,
    storage: Arc<dyn StorageProvider>,
    tunnel_timeout: Duration,
}

impl BackupRunner {
    pub fn new(tunnels: TunnelProviderFactory, executor: Arc<dyn DumpExecutor>, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            tunnels,
            executor,
            storage,
            tunnel_timeout: DEFAULT_ESTABLISH_TIMEOUT,
        }
    }

    pub fn with_tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_timeout = timeout;
        self
    }

    /// Back up the selected databases of `request.server`.
    ///
    /// `job` must be pending. It ends up completed or failed, and on failure
    /// the error is both logged into the job and returned.
    pub async fn run_backup(&self, job: &mut BackupJob, request: &BackupRequest) -> Result<Vec<StoredArtifact>> {
        if let Err(err) = validate_backup(request) {
            job.mark_failed(&err)?;
            return Err(err);
        }
        job.mark_running()?;
        info!(job_id = %job.id(), server = %request.server.server_name, "Starting backup");

        let mut tunnel = TunnelManager::with_timeout((self.tunnels)(), self.tunnel_timeout);
        let result = self.backup_databases(job, &mut tunnel, request).await;
        tunnel.close(job).await;

        self.finish(job, result)
    }

    /// Restore one artifact into `request.database`
    pub async fn run_restore(&self, job: &mut BackupJob, request: &RestoreRequest) -> Result<()> {
        if let Err(err) = validate_restore(request) {
            job.mark_failed(&err)?;
            return Err(err);
        }
        job.mark_running()?;
        info!(job_id = %job.id(), server = %request.server.server_name, filename = %request.filename, "Starting restore");

        let mut tunnel = TunnelManager::with_timeout((self.tunnels)(), self.tunnel_timeout);
        let result = self.restore_artifact(job, &mut tunnel, request).await;
        tunnel.close(job).await;

        self.finish(job, result)
    }

    fn finish<T>(&self, job: &mut BackupJob, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                job.mark_completed()?;
                Ok(value)
            }
            Err(err) => {
                error!(job_id = %job.id(), error = %err, "Job failed");
                job.mark_failed(&err)?;
                Err(err)
            }
        }
    }

    async fn backup_databases(
        &self,
        job: &mut BackupJob,
        tunnel: &mut TunnelManager,
        request: &BackupRequest,
    ) -> Result<Vec<StoredArtifact>> {
        let server = &request.server;
        if server.requires_ssh_tunnel() {
            tunnel.establish(server, job).await?;
        }
        let target = DumpTarget::resolve(server, tunnel);

        let databases = self.resolve_databases(&target, &request.selection).await?;
        if databases.is_empty() {
            return Err(BackupError::Validation(format!(
                "no databases on '{}' matched the selection",
                server.server_name
            )));
        }
        job.log(
            LogLevel::Info,
            format!("Backing up {} database(s): {}", databases.len(), databases.join(", ")),
        );

        let naming = SnapshotNaming::new(&server.server_name, server.database_type);
        let work_dir = tempdir()?;
        let mut artifacts = Vec::with_capacity(databases.len());

        for (index, database) in databases.iter().enumerate() {
            let local_path = work_dir
                .path()
                .join(format!("dump-{index}.{}", server.database_type.dump_extension()));

            match self.dump_and_store(job, &target, &naming, database, &local_path).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(err) => {
                    self.discard_artifacts(job, &artifacts).await;
                    return Err(err);
                }
            }
        }

        Ok(artifacts)
    }

    async fn dump_and_store(
        &self,
        job: &mut BackupJob,
        target: &DumpTarget,
        naming: &SnapshotNaming,
        database: &str,
        local_path: &Path,
    ) -> Result<StoredArtifact> {
        let started = Utc::now();
        let outcome = self.executor.dump(&target.with_database(database), local_path).await?;
        job.log_command(
            outcome.command.clone(),
            outcome.output.clone(),
            Some(outcome.exit_code),
            Some(started),
        );
        if !outcome.succeeded() {
            return Err(BackupError::Dump(format!(
                "dump of '{}' exited with code {}",
                database, outcome.exit_code
            )));
        }

        let size_bytes = tokio::fs::metadata(local_path).await?.len();
        let filename = naming.filename(database);
        self.storage.store(local_path, &filename).await?;
        job.log(LogLevel::Info, format!("Stored backup of '{database}' as {filename}"));

        // Only one dump at a time is kept on local disk
        if let Err(err) = tokio::fs::remove_file(local_path).await {
            warn!(path = %local_path.display(), error = %err, "Failed to remove local dump");
        }

        Ok(StoredArtifact {
            database: database.to_string(),
            filename,
            size_bytes,
        })
    }

    /// Remove artifacts of a run that failed part way through
    async fn discard_artifacts(&self, job: &mut BackupJob, artifacts: &[StoredArtifact]) {
        for artifact in artifacts {
            match self.storage.delete(&artifact.filename).await {
                Ok(()) => {
                    job.log(LogLevel::Info, format!("Removed partial artifact {}", artifact.filename));
                }
                Err(err) => {
                    warn!(filename = %artifact.filename, error = %err, "Failed to remove partial artifact");
                    job.log(
                        LogLevel::Warning,
                        format!("Failed to remove partial artifact {}: {err}", artifact.filename),
                    );
                }
            }
        }
    }

    async fn resolve_databases(&self, target: &DumpTarget, selection: &DatabaseSelection) -> Result<Vec<String>> {
        match selection {
            DatabaseSelection::Named(names) => Ok(names.clone()),
            DatabaseSelection::All => self.executor.list_databases(target).await,
            DatabaseSelection::Pattern(pattern) => {
                let available = self.executor.list_databases(target).await?;
                Ok(filter_by_pattern(&available, pattern))
            }
        }
    }

    async fn restore_artifact(&self, job: &mut BackupJob, tunnel: &mut TunnelManager, request: &RestoreRequest) -> Result<()> {
        let server = &request.server;
        if server.requires_ssh_tunnel() {
            tunnel.establish(server, job).await?;
        }

        let work_dir = tempdir()?;
        let local_path = work_dir.path().join("artifact");
        self.storage.retrieve(&request.filename, &local_path).await?;
        job.log(LogLevel::Info, format!("Retrieved artifact {}", request.filename));

        let target = DumpTarget::resolve(server, tunnel).with_database(&request.database);
        let index = job.start_command_log(self.executor.restore_command(&target, &local_path));

        match self.executor.restore(&target, &local_path).await {
            Ok(outcome) => {
                job.update_command_log(
                    index,
                    CommandUpdate {
                        output: outcome.output.clone(),
                        exit_code: Some(outcome.exit_code),
                    },
                );
                if !outcome.succeeded() {
                    return Err(BackupError::Dump(format!(
                        "restore into '{}' exited with code {}",
                        request.database, outcome.exit_code
                    )));
                }
                Ok(())
            }
            Err(err) => {
                job.update_command_log(
                    index,
                    CommandUpdate {
                        output: Some(err.to_string()),
                        exit_code: None,
                    },
                );
                Err(err)
            }
        }
    }
}

fn validate_server(server: &ConnectionConfig) -> Result<()> {
    if server.server_name.trim().is_empty() {
        return Err(BackupError::Validation("server name must not be empty".to_string()));
    }
    if server.host.trim().is_empty() {
        return Err(BackupError::Validation(format!(
            "server '{}' has no host",
            server.server_name
        )));
    }
    Ok(())
}

fn validate_backup(request: &BackupRequest) -> Result<()> {
    validate_server(&request.server)?;
    match &request.selection {
        DatabaseSelection::All => Ok(()),
        DatabaseSelection::Named(names) => {
            if names.is_empty() || names.iter().any(|name| name.trim().is_empty()) {
                return Err(BackupError::Validation("database names must not be empty".to_string()));
            }
            Ok(())
        }
        DatabaseSelection::Pattern(pattern) => {
            if !is_valid_pattern(pattern) {
                return Err(BackupError::Validation(format!("invalid database pattern '{pattern}'")));
            }
            Ok(())
        }
    }
}

fn validate_restore(request: &RestoreRequest) -> Result<()> {
    validate_server(&request.server)?;
    if request.database.trim().is_empty() {
        return Err(BackupError::Validation("restore target database must not be empty".to_string()));
    }
    if request.filename.is_empty() {
        return Err(BackupError::Validation("artifact filename must not be empty".to_string()));
    }
    validate_relative(&request.filename)?;
    Ok(())
}
