//! One remote host: SSH tunnel + authenticated wire + at most one session.
//!
//! All transport state sits behind a single async mutex, which gives two
//! guarantees the protocol relies on: RPCs issued against one host reach the
//! agent in issue order, and at most one transport recovery runs at a time
//! (concurrent callers observe either the recovered transport or the same
//! final error).
//!
//! Recovery is transport-only by design: tear down wire + tunnel, reopen
//! both, re-authenticate. It never redeploys and never allocates a new
//! session id, so the tmux session on the far end — and with it the shell's
//! working directory and environment — survives a dropped WebSocket.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::HostError;
use crate::protocol::{RpcRequest, RpcResponse, RpcResult};
use crate::registry::{ActiveSession, HostConfig};

use super::bootstrap;
use super::ssh;
use super::tunnel::SshTunnel;
use super::wire::{WireClient, WireError};

/// Session directories and ids are `hostlink-<8 hex>` under `/tmp`.
const SESSION_PREFIX: &str = "hostlink";

/// Default per-call RPC deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime descriptor of a deployed agent instance.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub session_id: String,
    pub remote_dir: String,
}

#[derive(Debug)]
struct HostState {
    config: HostConfig,
    session: Option<RemoteSession>,
    tunnel: Option<SshTunnel>,
    wire: Option<WireClient>,
}

/// A connection to one registered host.
#[derive(Debug)]
pub struct RemoteHost {
    name: String,
    use_tmux: bool,
    state: Mutex<HostState>,
}

impl RemoteHost {
    pub fn new(config: HostConfig) -> Self {
        RemoteHost {
            name: config.name.clone(),
            use_tmux: true,
            state: Mutex::new(HostState {
                config,
                session: None,
                tunnel: None,
                wire: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.wire.is_some() && state.session.is_some()
    }

    pub async fn session_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| s.session_id.clone())
    }

    /// The resumable descriptor for the current session, if connected.
    pub async fn active_session(&self) -> Option<ActiveSession> {
        let state = self.state.lock().await;
        let session = state.session.as_ref()?;
        let local_port = state.tunnel.as_ref().map(SshTunnel::local_port)?;
        Some(ActiveSession {
            session_id: session.session_id.clone(),
            remote_dir: session.remote_dir.clone(),
            remote_port: state.config.remote_port,
            local_port,
            auth_token: state.config.auth_token.clone(),
        })
    }

    /// Full connect: allocate a session, open the tunnel, deploy the agent,
    /// open and authenticate the wire. Idempotent — returns the existing
    /// session when already connected.
    pub async fn setup(&self) -> Result<ActiveSession, HostError> {
        let mut state = self.state.lock().await;
        if state.wire.is_some() && state.session.is_some() {
            drop(state);
            return Ok(self
                .active_session()
                .await
                .expect("connected host has a session"));
        }

        let session_id = new_session_id();
        let remote_dir = format!("/tmp/{session_id}");
        let session = RemoteSession {
            session_id: session_id.clone(),
            remote_dir: remote_dir.clone(),
        };

        let result = self.connect_fresh(&mut state, &session).await;
        match result {
            Ok(()) => {
                info!(
                    "Remote host {} connected (session: {session_id})",
                    self.name
                );
                drop(state);
                Ok(self
                    .active_session()
                    .await
                    .expect("setup just connected"))
            }
            Err(e) => {
                // Pull the agent log while the host is still reachable, then
                // release whatever half-open transport we hold.
                self.log_remote_tail(&state.config, &remote_dir).await;
                if let Some(mut tunnel) = state.tunnel.take() {
                    tunnel.close().await;
                }
                state.wire = None;
                state.session = None;
                Err(e)
            }
        }
    }

    async fn connect_fresh(
        &self,
        state: &mut HostState,
        session: &RemoteSession,
    ) -> Result<(), HostError> {
        let tunnel = SshTunnel::open(&state.config, None).await?;
        state.config.local_port = Some(tunnel.local_port());
        state.tunnel = Some(tunnel);

        bootstrap::deploy(&state.config, &session.remote_dir, self.use_tmux).await?;

        let wire = WireClient::connect(
            state.config.local_port.expect("tunnel just opened"),
            state.config.auth_token.as_deref(),
        )
        .await
        .map_err(map_connect_error)?;

        state.wire = Some(wire);
        state.session = Some(session.clone());
        Ok(())
    }

    /// Rebind to a previously recorded session without redeploying: restore
    /// the recorded port and token, recover the transport, and verify the
    /// agent answers a ping.
    pub async fn resume(&self, recorded: ActiveSession) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.config.remote_port = recorded.remote_port;
        if recorded.auth_token.is_some() {
            state.config.auth_token = recorded.auth_token.clone();
        }
        state.session = Some(RemoteSession {
            session_id: recorded.session_id.clone(),
            remote_dir: recorded.remote_dir.clone(),
        });

        self.recover_transport(&mut state).await?;

        // The tunnel and wire are up; make sure an agent is actually there.
        let wire = state.wire.as_mut().expect("recovery opened the wire");
        wire.ping().await.map_err(|e| {
            HostError::RemoteServerUnresponsive(format!("resume ping failed: {e}"))
        })?;

        info!(
            "Resumed session {} on host {}",
            recorded.session_id, self.name
        );
        Ok(())
    }

    /// Single entry point for all RPC types.
    ///
    /// Transport failures trigger exactly one transport-only recovery and a
    /// retry of the **same** request (same `request_id`, same payload) — the
    /// agent's idempotency cache makes the retry safe. Deadline expiry is
    /// surfaced as [`HostError::Timeout`] and leaves the transport alone.
    pub async fn rpc(
        &self,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResult, HostError> {
        let mut state = self.state.lock().await;

        // Never-connected hosts get a full setup; a host that lost its
        // transport mid-session is only ever recovered.
        if state.wire.is_none() {
            if state.session.is_some() {
                self.recover_transport(&mut state).await?;
            } else {
                drop(state);
                self.setup().await?;
                state = self.state.lock().await;
            }
        }

        for attempt in 0..2 {
            let wire = state
                .wire
                .as_mut()
                .ok_or_else(|| HostError::RemoteServerUnresponsive("wire not open".into()))?;

            match wire.call(&request, timeout).await {
                Ok(response) => return map_response(response),
                Err(WireError::Timeout { seconds }) => {
                    return Err(HostError::Timeout { seconds });
                }
                Err(WireError::Transport(msg)) if attempt == 0 => {
                    warn!(
                        "RPC transport failure on {}, attempting recovery: {msg}",
                        self.name
                    );
                    self.recover_transport(&mut state).await?;
                }
                Err(WireError::Transport(msg)) => {
                    return Err(HostError::RemoteServerUnresponsive(msg));
                }
                Err(WireError::Unauthorized(msg)) => {
                    return Err(HostError::Unauthorized(msg));
                }
                Err(WireError::Connect(msg)) => {
                    return Err(HostError::RemoteServerUnresponsive(msg));
                }
            }
        }
        Err(HostError::RemoteServerUnresponsive("RPC retry exhausted".into()))
    }

    /// Small RPC used for active verification by the manager.
    pub async fn ping(&self) -> bool {
        self.rpc(RpcRequest::Ping, Duration::from_secs(5))
            .await
            .is_ok()
    }

    /// Tear down the remote session and the transport, in order, each step
    /// best-effort. Reports success only when the remote session directory
    /// was actually removed — partial cleanup is never reported as success.
    pub async fn teardown(&self) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        let session = state.session.clone();

        // Step 1: graceful shutdown over the wire.
        let mut acked = false;
        if let Some(mut wire) = state.wire.take() {
            acked = wire.shutdown().await;
            wire.close().await;
            if acked {
                info!("Agent on {} acknowledged shutdown", self.name);
                // Give it a moment for executor cleanup before we go digging
                // with SSH.
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        let mut result = Ok(());
        if let Some(session) = &session {
            // Step 2: force-stop fallback when the ack never came.
            if !acked {
                if let Err(e) = self.force_stop(&state.config, session).await {
                    warn!("Force-stop on {} failed: {e}", self.name);
                }
            }

            // Step 3: remove the session directory. This is the step that
            // decides success.
            let rm = format!("rm -rf {}", ssh::sh_quote(&session.remote_dir));
            match ssh::exec_status(&state.config, &rm, Duration::from_secs(30)).await {
                Ok(output) if output.exit_code == 0 => {}
                Ok(output) => {
                    result = Err(HostError::Ssh(format!(
                        "failed to remove {}: {}",
                        session.remote_dir,
                        output.stderr.trim()
                    )));
                }
                Err(e) => result = Err(e),
            }
        }

        // Step 4: close the tunnel last.
        if let Some(mut tunnel) = state.tunnel.take() {
            tunnel.close().await;
        }

        if result.is_ok() {
            state.session = None;
            info!("Remote host {} disconnected", self.name);
        }
        result
    }

    /// Transport-only recovery: drop wire and tunnel, reopen both, and
    /// re-authenticate against the existing session. Failures are classified
    /// by which leg broke: SSH → `NetworkUnreachable`, WebSocket/auth →
    /// `RemoteServerUnresponsive` / `Unauthorized`.
    async fn recover_transport(&self, state: &mut HostState) -> Result<(), HostError> {
        state.wire = None;
        if let Some(mut tunnel) = state.tunnel.take() {
            tunnel.close().await;
        }

        let tunnel = SshTunnel::open(&state.config, None).await?;
        state.config.local_port = Some(tunnel.local_port());
        state.tunnel = Some(tunnel);

        let wire = WireClient::connect(
            state.config.local_port.expect("tunnel just opened"),
            state.config.auth_token.as_deref(),
        )
        .await
        .map_err(map_connect_error);

        match wire {
            Ok(wire) => {
                state.wire = Some(wire);
                if let Some(session) = &state.session {
                    info!(
                        "Transport recovered for {} (session: {})",
                        self.name, session.session_id
                    );
                }
                Ok(())
            }
            Err(e) => {
                if let Some(mut tunnel) = state.tunnel.take() {
                    tunnel.close().await;
                }
                Err(e)
            }
        }
    }

    /// SSH-side kill of the agent: PID file first (TERM, grace, KILL), then
    /// by port, then the tmux session.
    async fn force_stop(
        &self,
        config: &HostConfig,
        session: &RemoteSession,
    ) -> Result<(), HostError> {
        info!("Force-stopping agent for session {}", session.session_id);
        let dir = &session.remote_dir;
        let pid_file = format!("{dir}/server.pid");

        ssh::exec(
            config,
            &format!(
                "if [ -f {pid} ]; then pid=$(cat {pid}); \
                 kill $pid 2>/dev/null && sleep 1; \
                 kill -0 $pid 2>/dev/null && kill -9 $pid 2>/dev/null; \
                 fi || true",
                pid = ssh::sh_quote(&pid_file)
            ),
            Duration::from_secs(15),
        )
        .await?;

        ssh::exec(
            config,
            &format!("fuser -k {}/tcp 2>/dev/null || true", config.remote_port),
            Duration::from_secs(15),
        )
        .await?;

        ssh::exec(
            config,
            &format!(
                "tmux -S {} kill-session -t {SESSION_PREFIX} 2>/dev/null || true",
                ssh::sh_quote(&format!("{dir}/tmux.sock"))
            ),
            Duration::from_secs(15),
        )
        .await?;

        Ok(())
    }

    /// Best-effort fetch of the agent log tail for setup failure diagnostics.
    async fn log_remote_tail(&self, config: &HostConfig, remote_dir: &str) {
        let cmd = format!(
            "tail -50 {} 2>/dev/null || echo 'log file not found'",
            ssh::sh_quote(&format!("{remote_dir}/remote_server.log"))
        );
        if let Ok(tail) = ssh::exec(config, &cmd, Duration::from_secs(15)).await {
            if !tail.is_empty() {
                warn!("Agent log on {}:\n{tail}", self.name);
            }
        }
    }
}

fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{SESSION_PREFIX}-{}", &hex[..8])
}

fn map_connect_error(e: WireError) -> HostError {
    match e {
        WireError::Unauthorized(msg) => HostError::Unauthorized(msg),
        other => HostError::RemoteServerUnresponsive(other.to_string()),
    }
}

/// Collapse a wire response into either an application result (passed through
/// verbatim, success or not) or a typed protocol error.
fn map_response(response: RpcResponse) -> Result<RpcResult, HostError> {
    match response {
        RpcResponse::Result(result) => Ok(result),
        RpcResponse::Pong => Ok(RpcResult {
            success: true,
            ..RpcResult::default()
        }),
        RpcResponse::Error { code, message, .. } => {
            if code.as_deref() == Some("request_id_conflict") {
                Err(HostError::RequestIdConflict(message))
            } else {
                Err(HostError::Protocol(message))
            }
        }
        other => Err(HostError::Protocol(format!(
            "unexpected response type: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_carry_prefix_and_8_hex() {
        let id = new_session_id();
        let suffix = id.strip_prefix("hostlink-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn conflict_code_maps_to_typed_error() {
        let err = map_response(RpcResponse::Error {
            request_id: Some("r".into()),
            code: Some("request_id_conflict".into()),
            message: "reuse".into(),
        })
        .unwrap_err();
        assert!(matches!(err, HostError::RequestIdConflict(_)));
    }

    #[test]
    fn application_failures_pass_through() {
        let result = map_response(RpcResponse::Result(RpcResult::failure("File not found: /x")))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("File not found: /x"));
    }
}
