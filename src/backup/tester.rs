//! Reachability checks for user-entered server details.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::backup::connection::ConnectionConfig;
use crate::backup::job::BackupJob;
use crate::backup::tunnel::{DEFAULT_ESTABLISH_TIMEOUT, TunnelManager, TunnelProviderFactory};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a connection test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<u64>,
    pub via_tunnel: bool,
}

impl ConnectionTestResult {
    fn failure(message: impl Into<String>, via_tunnel: bool) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: None,
            via_tunnel,
        }
    }
}

#[async_trait]
pub trait ConnectionTester: Send + Sync {
    /// Check that `server` is reachable, never returning an error
    async fn test(&self, server: &ConnectionConfig) -> ConnectionTestResult;
}

/// Tests reachability by opening a TCP connection to the database port,
/// through an SSH tunnel when the server needs one.
pub struct TcpConnectionTester {
    tunnels: TunnelProviderFactory,
    tunnel_timeout: Duration,
    connect_timeout: Duration,
}

impl TcpConnectionTester {
    pub fn new(tunnels: TunnelProviderFactory) -> Self {
        Self {
            tunnels,
            tunnel_timeout: DEFAULT_ESTABLISH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, tunnel_timeout: Duration, connect_timeout: Duration) -> Self {
        self.tunnel_timeout = tunnel_timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connect(&self, host: &str, port: u16, via_tunnel: bool) -> ConnectionTestResult {
        let started = Instant::now();
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(host, port, latency_ms, via_tunnel, "Connection test succeeded");
                ConnectionTestResult {
                    success: true,
                    message: format!("Connected to {host}:{port}"),
                    latency_ms: Some(latency_ms),
                    via_tunnel,
                }
            }
            Ok(Err(err)) => ConnectionTestResult::failure(format!("Could not connect to {host}:{port}: {err}"), via_tunnel),
            Err(_) => ConnectionTestResult::failure(
                format!("Timed out after {:?} connecting to {host}:{port}", self.connect_timeout),
                via_tunnel,
            ),
        }
    }
}

#[async_trait]
impl ConnectionTester for TcpConnectionTester {
    async fn test(&self, server: &ConnectionConfig) -> ConnectionTestResult {
        if server.database_type.is_file_based() {
            return ConnectionTestResult {
                success: true,
                message: format!("{} databases are file-based; nothing to connect to", server.database_type),
                latency_ms: None,
                via_tunnel: false,
            };
        }

        if !server.requires_ssh_tunnel() {
            return self.connect(&server.host, server.port, false).await;
        }

        // Scratch job; only the tunnel lifecycle is of interest here
        let mut job = BackupJob::new();
        let mut tunnel = TunnelManager::with_timeout((self.tunnels)(), self.tunnel_timeout);

        let result = match tunnel.establish(server, &mut job).await {
            Ok(_) => {
                let host = tunnel.connection_host(server).to_string();
                let port = tunnel.connection_port(server);
                self.connect(&host, port, true).await
            }
            Err(err) => {
                warn!(server = %server.server_name, error = %err, "Connection test could not open tunnel");
                ConnectionTestResult::failure(err.to_string(), true)
            }
        };
        tunnel.close(&mut job).await;
        result
    }
}
