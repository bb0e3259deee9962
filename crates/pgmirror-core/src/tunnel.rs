//! SSH tunnel lifecycle and remote-read retry
//!
//! The sync engine never talks to the remote host directly; it connects to
//! the tunnel's local endpoint. The tunnel is opened once per command and
//! torn down on completion or on a signal.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long to wait for the forwarded port to accept connections.
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll interval while waiting for the forwarded port.
const OPEN_POLL: Duration = Duration::from_millis(250);

/// Tunnel parameters for one named connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// SSH host (the bastion).
    pub host: String,
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Local port the remote database is forwarded to.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Database host as seen from the bastion.
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    15432
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_port() -> u16 {
    5432
}

impl TunnelSettings {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// A forwarding tunnel. Cloneable so a signal handler can close the same
/// underlying process the orchestrator opened.
#[derive(Debug, Clone)]
pub struct Tunnel {
    settings: TunnelSettings,
    child: Arc<Mutex<Option<Child>>>,
}

impl Tunnel {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Local endpoint source connections should use.
    pub fn endpoint(&self) -> (&str, u16) {
        ("127.0.0.1", self.settings.local_port)
    }

    /// Spawn `ssh -N -L` and wait until the forwarded port accepts
    /// connections.
    pub async fn open(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let forward = format!(
            "{}:{}:{}",
            self.settings.local_port, self.settings.remote_host, self.settings.remote_port
        );
        info!(
            host = %self.settings.host,
            forward = %forward,
            "Opening SSH tunnel"
        );

        let child = Command::new("ssh")
            .arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-p")
            .arg(self.settings.port.to_string())
            .arg("-L")
            .arg(&forward)
            .arg(self.settings.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tunnel(format!("failed to spawn ssh: {}", e)))?;

        *guard = Some(child);
        drop(guard);

        let deadline = tokio::time::Instant::now() + OPEN_TIMEOUT;
        loop {
            if TcpStream::connect(("127.0.0.1", self.settings.local_port))
                .await
                .is_ok()
            {
                debug!(port = self.settings.local_port, "Tunnel endpoint is up");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                self.close().await;
                return Err(Error::Tunnel(format!(
                    "tunnel to {} did not come up on port {} within {:?}",
                    self.settings.host, self.settings.local_port, OPEN_TIMEOUT
                )));
            }
            tokio::time::sleep(OPEN_POLL).await;
        }
    }

    /// Kill the ssh process. Safe to call more than once.
    pub async fn close(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill ssh tunnel: {}", e);
            }
            info!("SSH tunnel closed");
        }
    }
}

/// Bounded retry for reads that cross the tunnel.
///
/// Scope is exactly one read call; target writes are never wrapped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op`, retrying on error with linear backoff.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    warn!(attempt, "Remote read failed, retrying: {}", e);
                    tokio::time::sleep(self.delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Tunnel("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Tunnel("down".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn settings_defaults() {
        let settings: TunnelSettings =
            toml::from_str("host = \"bastion.example.com\"").expect("parse");
        assert_eq!(settings.port, 22);
        assert_eq!(settings.local_port, 15432);
        assert_eq!(settings.remote_host, "127.0.0.1");
        assert_eq!(settings.remote_port, 5432);
        assert_eq!(settings.destination(), "bastion.example.com");
    }

    #[test]
    fn destination_includes_user() {
        let settings: TunnelSettings =
            toml::from_str("host = \"bastion\"\nuser = \"deploy\"").expect("parse");
        assert_eq!(settings.destination(), "deploy@bastion");
    }
}
