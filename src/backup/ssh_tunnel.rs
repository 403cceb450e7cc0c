//! [`TunnelProvider`] backed by the system `ssh` binary.
//!
//! Runs `ssh -N -L 127.0.0.1:<local>:<db host>:<db port>` as a child
//! process. Password authentication goes through `sshpass -e`.

use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backup::TunnelError;
use crate::backup::connection::{ConnectionConfig, SshAuthType, SshConfig};
use crate::backup::tunnel::{TunnelEndpoint, TunnelProvider};

const LOCAL_HOST: &str = "127.0.0.1";
const READINESS_POLL: Duration = Duration::from_millis(100);

struct ActiveTunnel {
    child: Child,
    endpoint: TunnelEndpoint,
    // Removed from disk when the tunnel goes away
    _identity_file: Option<NamedTempFile>,
}

/// Spawns one `ssh` port-forward per instance
pub struct SshCommandTunnel {
    ssh_binary: PathBuf,
    sshpass_binary: PathBuf,
    readiness_timeout: Duration,
    active: Mutex<Option<ActiveTunnel>>,
}

impl SshCommandTunnel {
    pub fn new(ssh_binary: impl Into<PathBuf>, sshpass_binary: impl Into<PathBuf>, readiness_timeout: Duration) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            sshpass_binary: sshpass_binary.into(),
            readiness_timeout,
            active: Mutex::new(None),
        }
    }

    /// Build the command line for `server`. Returns the identity file that
    /// must outlive the child process.
    fn build_command(
        &self,
        server: &ConnectionConfig,
        ssh: &SshConfig,
        local_port: u16,
    ) -> Result<(Command, Option<NamedTempFile>), TunnelError> {
        let mut identity_file = None;

        let mut command = match ssh.auth_type {
            SshAuthType::Password => {
                let password = ssh.password.as_deref().ok_or_else(|| {
                    TunnelError::Establish("password authentication selected but no password set".to_string())
                })?;
                let mut command = Command::new(&self.sshpass_binary);
                command.env("SSHPASS", password).arg("-e").arg(&self.ssh_binary);
                command
            }
            SshAuthType::PrivateKey => {
                if ssh.key_passphrase.as_deref().is_some_and(|p| !p.is_empty()) {
                    return Err(TunnelError::Unsupported(
                        "passphrase-protected private keys cannot be used non-interactively".to_string(),
                    ));
                }
                let key = ssh.private_key.as_deref().ok_or_else(|| {
                    TunnelError::Establish("key authentication selected but no private key set".to_string())
                })?;
                let file = write_identity_file(key)?;
                let mut command = Command::new(&self.ssh_binary);
                command
                    .arg("-i")
                    .arg(file.path())
                    .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
                identity_file = Some(file);
                command
            }
        };

        command
            .args(["-N", "-o", "ExitOnForwardFailure=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-p")
            .arg(ssh.port.to_string())
            .arg("-L")
            .arg(format!("{LOCAL_HOST}:{local_port}:{}:{}", server.host, server.port))
            .arg(format!("{}@{}", ssh.username, ssh.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        Ok((command, identity_file))
    }

    async fn wait_until_ready(&self, child: &mut Child, local_port: u16) -> Result<(), TunnelError> {
        let deadline = tokio::time::Instant::now() + self.readiness_timeout;
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| TunnelError::Establish(format!("failed to poll ssh process: {e}")))?
            {
                return Err(TunnelError::Establish(format!("ssh exited early with {status}")));
            }
            if TcpStream::connect((LOCAL_HOST, local_port)).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TunnelError::Timeout(self.readiness_timeout));
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }
}

#[async_trait]
impl TunnelProvider for SshCommandTunnel {
    async fn establish(&self, server: &ConnectionConfig) -> Result<TunnelEndpoint, TunnelError> {
        let ssh = server
            .ssh_config
            .as_ref()
            .ok_or_else(|| TunnelError::Establish(format!("server '{}' has no SSH configuration", server.server_name)))?;

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(TunnelError::Establish("a tunnel is already active for this provider".to_string()));
        }

        let local_port = allocate_local_port()?;
        let (mut command, identity_file) = self.build_command(server, ssh, local_port)?;

        debug!(ssh_host = %ssh.host, ssh_port = ssh.port, local_port, "Spawning ssh port forward");
        let mut child = command
            .spawn()
            .map_err(|e| TunnelError::Establish(format!("failed to spawn ssh: {e}")))?;

        if let Err(err) = self.wait_until_ready(&mut child, local_port).await {
            let _ = child.kill().await;
            return Err(err);
        }

        let endpoint = TunnelEndpoint {
            host: LOCAL_HOST.to_string(),
            port: local_port,
        };
        info!(ssh_host = %ssh.host, local_port, "SSH port forward ready");
        *active = Some(ActiveTunnel {
            child,
            endpoint: endpoint.clone(),
            _identity_file: identity_file,
        });
        Ok(endpoint)
    }

    async fn is_active(&self) -> bool {
        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(tunnel) => matches!(tunnel.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let Some(mut tunnel) = self.active.lock().await.take() else {
            return Ok(());
        };
        debug!(local_port = tunnel.endpoint.port, "Stopping ssh port forward");
        tunnel
            .child
            .kill()
            .await
            .map_err(|e| TunnelError::Close(e.to_string()))
    }
}

/// Let the OS pick a free port, then release it for ssh to bind
fn allocate_local_port() -> Result<u16, TunnelError> {
    let listener = TcpListener::bind((LOCAL_HOST, 0))
        .map_err(|e| TunnelError::Establish(format!("failed to allocate local port: {e}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| TunnelError::Establish(format!("failed to allocate local port: {e}")))
}

/// tempfile creates the file with mode 0600 on unix, as ssh requires
fn write_identity_file(key: &str) -> Result<NamedTempFile, TunnelError> {
    let write = || -> std::io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(key.as_bytes())?;
        // ssh rejects keys without a trailing newline
        if !key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(file)
    };
    write().map_err(|e| TunnelError::Establish(format!("failed to write identity file: {e}")))
}
