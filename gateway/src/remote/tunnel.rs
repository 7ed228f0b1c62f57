//! SSH port-forward from a local ephemeral port to the agent's loopback port.
//!
//! One tunnel is owned by exactly one [`RemoteHost`](super::host::RemoteHost);
//! tunnels are never shared across hosts. The forward is a plain `ssh -N -L`
//! child process — no libssh bindings, matching how the rest of the gateway
//! shells out for scp and remote commands.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::registry::HostConfig;

use super::ssh;

/// How long `open` waits for the local forward socket to accept.
const OPEN_TIMEOUT: Duration = Duration::from_secs(20);
/// Delay between connect probes while the tunnel comes up.
const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// A live `ssh -N -L` forward. Closing is idempotent; dropping the struct
/// kills the child as a backstop.
#[derive(Debug)]
pub struct SshTunnel {
    child: Option<Child>,
    local_port: u16,
}

impl SshTunnel {
    /// Open a forward from `127.0.0.1:<local>` to `127.0.0.1:<remote_port>`
    /// on the target host. Uses `preferred_local_port` when given (session
    /// resume), otherwise binds an ephemeral port.
    ///
    /// Fails with [`HostError::NetworkUnreachable`] if the SSH transport is
    /// not up within 20 seconds.
    pub async fn open(
        config: &HostConfig,
        preferred_local_port: Option<u16>,
    ) -> Result<SshTunnel, HostError> {
        let local_port = match preferred_local_port {
            Some(port) => port,
            None => free_local_port().await?,
        };

        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("{local_port}:127.0.0.1:{}", config.remote_port),
        ];
        args.extend(ssh::base_args(config));
        args.push(config.ssh_target.clone());

        info!(
            "Opening SSH tunnel {} -> localhost:{local_port}",
            config.ssh_target
        );

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::NetworkUnreachable(format!("failed to spawn ssh: {e}")))?;

        // Wait until ssh is listening locally, failing fast if it exits.
        let deadline = tokio::time::Instant::now() + OPEN_TIMEOUT;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                let stderr = read_stderr(&mut child).await;
                return Err(HostError::NetworkUnreachable(format!(
                    "ssh exited with {status}: {}",
                    stderr.trim()
                )));
            }
            if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(HostError::NetworkUnreachable(format!(
                    "SSH tunnel to {} not ready after {}s",
                    config.ssh_target,
                    OPEN_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        debug!("SSH tunnel ready on 127.0.0.1:{local_port}");
        Ok(SshTunnel {
            child: Some(child),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Cheap liveness check: the ssh child is still running and the local
    /// forward socket accepts.
    pub async fn probe(&mut self) -> bool {
        let alive = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        alive && TcpStream::connect(("127.0.0.1", self.local_port)).await.is_ok()
    }

    /// Terminate the ssh child and release the listening socket. Safe to call
    /// more than once.
    pub async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            // SIGTERM first; escalate to SIGKILL if it lingers.
            if let Some(pid) = child.id() {
                let _ = Command::new("kill").arg(pid.to_string()).output().await;
            }
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("SSH tunnel did not exit after SIGTERM, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
            debug!("SSH tunnel on port {} closed", self.local_port);
        }
    }
}

/// Bind an ephemeral port on loopback and release it for ssh to claim.
async fn free_local_port() -> Result<u16, HostError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| HostError::NetworkUnreachable(format!("no free local port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| HostError::NetworkUnreachable(e.to_string()))?
        .port();
    drop(listener);
    Ok(port)
}

/// Drain whatever stderr the exited ssh child produced.
async fn read_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_local_port_yields_bindable_port() {
        let port = free_local_port().await.unwrap();
        assert!(port > 0);
        // The port was released; we can bind it again.
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_without_child() {
        let mut tunnel = SshTunnel {
            child: None,
            local_port: 1,
        };
        tunnel.close().await;
        tunnel.close().await;
        assert!(!tunnel.probe().await);
    }
}
