//! Health probes.
//!
//! A probe answers one question about one target: is it up right now?

use crate::config::{HealthCheckConfig, HealthCheckType};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

/// Why a probe considered a target down.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid HTTP response: {0}")]
    InvalidResponse(String),

    #[error("unexpected status: {got} (expected {expected})")]
    UnexpectedStatus { got: u16, expected: u16 },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("script exited with {0}")]
    ScriptFailed(std::process::ExitStatus),
}

/// A way of checking whether a target is up.
pub trait HealthProbe: Send + Sync {
    /// Probe `target`, giving up after `limit`.
    fn probe(&self, target: SocketAddr, limit: Duration) -> BoxFuture<'_, Result<(), ProbeError>>;
}

/// Build the probe described by the configuration.
pub fn build_probe(config: &HealthCheckConfig) -> Arc<dyn HealthProbe> {
    match config.check_type {
        HealthCheckType::Tcp => Arc::new(TcpProbe),
        HealthCheckType::Http => Arc::new(HttpProbe {
            path: config.path.clone().unwrap_or_else(|| "/".to_string()),
            expected_status: config.expected_status,
        }),
        HealthCheckType::Script => Arc::new(ScriptProbe {
            command: config.command.clone().unwrap_or_default(),
        }),
    }
}

async fn connect(target: SocketAddr, limit: Duration) -> Result<TcpStream, ProbeError> {
    match timeout(limit, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProbeError::Connect(e)),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Up if a TCP connection can be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl HealthProbe for TcpProbe {
    fn probe(&self, target: SocketAddr, limit: Duration) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(async move {
            connect(target, limit).await?;
            Ok(())
        })
    }
}

/// Up if `GET path` answers with the expected status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub path: String,
    pub expected_status: u16,
}

impl HealthProbe for HttpProbe {
    fn probe(&self, target: SocketAddr, limit: Duration) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(async move {
            let check = async {
                let mut stream = connect(target, limit).await?;

                let request = format!(
                    "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                    self.path, target
                );
                stream.write_all(request.as_bytes()).await?;

                // Only the status line matters.
                let mut buf = vec![0u8; 1024];
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(ProbeError::InvalidResponse("empty response".to_string()));
                }

                let status = parse_http_status(&String::from_utf8_lossy(&buf[..n]))?;
                if status == self.expected_status {
                    Ok(())
                } else {
                    Err(ProbeError::UnexpectedStatus {
                        got: status,
                        expected: self.expected_status,
                    })
                }
            };

            timeout(limit, check).await.map_err(|_| ProbeError::Timeout)?
        })
    }
}

/// Parse HTTP status code from response.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    // Format: "HTTP/1.1 200 OK\r\n..."
    let mut parts = response.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProbeError::InvalidResponse(format!("invalid status code '{}'", code))),
        _ => Err(ProbeError::InvalidResponse("missing status line".to_string())),
    }
}

/// Up if `command <ip> <port>` exits successfully.
#[derive(Debug, Clone)]
pub struct ScriptProbe {
    pub command: PathBuf,
}

impl HealthProbe for ScriptProbe {
    fn probe(&self, target: SocketAddr, limit: Duration) -> BoxFuture<'_, Result<(), ProbeError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.command)
                .arg(target.ip().to_string())
                .arg(target.port().to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ProbeError::Spawn {
                    command: self.command.display().to_string(),
                    source,
                })?;

            let status = timeout(limit, child.wait())
                .await
                .map_err(|_| ProbeError::Timeout)??;
            if status.success() {
                Ok(())
            } else {
                Err(ProbeError::ScriptFailed(status))
            }
        })
    }
}
