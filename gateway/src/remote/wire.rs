//! Authenticated WebSocket carrying RPC frames to the agent.
//!
//! RPCs on a single host are serialized by [`RemoteHost`](super::host), so the
//! wire client owns the whole stream and reads frames inline until the
//! response it is waiting for arrives. Responses are matched by `request_id`;
//! anything unsolicited is logged and skipped. A deadline expiry leaves the
//! connection open — the in-flight remote work may still complete and the
//! caller decides whether to retry with a fresh id.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::protocol::{AuthFrame, RpcRequest, RpcResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Failures below the RPC layer. [`RemoteHost`](super::host) maps `Transport`
/// into a recovery attempt and the rest into typed [`HostError`]s.
#[derive(Debug)]
pub enum WireError {
    /// The socket failed mid-call (closed, reset, write error). Recoverable.
    Transport(String),
    /// The per-call deadline expired while waiting for the response.
    Timeout { seconds: u64 },
    /// The agent rejected the auth handshake.
    Unauthorized(String),
    /// The connection or handshake could not be established.
    Connect(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Transport(msg) => write!(f, "transport failure: {msg}"),
            WireError::Timeout { seconds } => write!(f, "no response within {seconds}s"),
            WireError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            WireError::Connect(msg) => write!(f, "connect failed: {msg}"),
        }
    }
}

/// One authenticated WebSocket connection to an agent.
pub struct WireClient {
    ws: WsStream,
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient").finish_non_exhaustive()
    }
}

impl WireClient {
    /// Connect to `ws://127.0.0.1:<local_port>` through the tunnel and run
    /// the auth handshake. The first frame out is `{"token": ...}`; the agent
    /// answers `authenticated` or an error frame.
    pub async fn connect(local_port: u16, auth_token: Option<&str>) -> Result<Self, WireError> {
        let url = format!("ws://127.0.0.1:{local_port}");
        debug!("Connecting WebSocket: {url}");

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| WireError::Connect(format!("WebSocket connect timeout: {url}")))?
            .map_err(|e| WireError::Connect(format!("WebSocket connect failed: {e}")))?;

        let mut client = WireClient { ws };

        let auth = AuthFrame {
            token: auth_token.unwrap_or_default().to_string(),
        };
        client
            .send_json(&serde_json::to_string(&auth).expect("auth frame serializes"))
            .await
            .map_err(|e| WireError::Connect(e.to_string()))?;

        match client.next_response(AUTH_TIMEOUT).await {
            Ok(RpcResponse::Authenticated) => Ok(client),
            Ok(RpcResponse::Error { message, .. }) => Err(WireError::Unauthorized(message)),
            Ok(other) => Err(WireError::Connect(format!(
                "unexpected auth response: {other:?}"
            ))),
            Err(WireError::Timeout { .. }) => {
                Err(WireError::Connect("no auth response within 5s".into()))
            }
            Err(e) => Err(WireError::Connect(e.to_string())),
        }
    }

    /// Send one request and wait for its response within `deadline`.
    ///
    /// For requests carrying a `request_id`, only a `result` or `error` frame
    /// with the same id matches. `ping` matches the next `pong`.
    pub async fn call(
        &mut self,
        request: &RpcRequest,
        deadline: Duration,
    ) -> Result<RpcResponse, WireError> {
        let text = serde_json::to_string(request)
            .map_err(|e| WireError::Transport(format!("serialize request: {e}")))?;
        self.send_json(&text).await?;

        let expect_id = request.request_id().map(str::to_string);
        let started = tokio::time::Instant::now();

        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(WireError::Timeout {
                    seconds: deadline.as_secs(),
                })?;
            let response = self.next_response(remaining).await.map_err(|e| match e {
                WireError::Timeout { .. } => WireError::Timeout {
                    seconds: deadline.as_secs(),
                },
                other => other,
            })?;

            match (&expect_id, &response) {
                // Correlated flows: match on the echoed request_id.
                (Some(id), RpcResponse::Result(result)) => {
                    if result.request_id.as_deref() == Some(id.as_str()) {
                        return Ok(response);
                    }
                    warn!("Ignoring result for stale request {:?}", result.request_id);
                }
                (Some(id), RpcResponse::Error { request_id, .. }) => {
                    if request_id.as_deref() == Some(id.as_str()) {
                        return Ok(response);
                    }
                    warn!("Ignoring error for stale request {request_id:?}");
                }
                // Untracked flows: take the next frame of the right shape.
                (None, RpcResponse::Pong)
                | (None, RpcResponse::ShutdownAck)
                | (None, RpcResponse::Result(_))
                | (None, RpcResponse::Error { .. }) => return Ok(response),
                (_, other) => {
                    warn!("Ignoring unsolicited frame: {other:?}");
                }
            }
        }
    }

    /// Liveness probe: `ping` → `pong` within 5 seconds.
    pub async fn ping(&mut self) -> Result<(), WireError> {
        match self.call(&RpcRequest::Ping, Duration::from_secs(5)).await? {
            RpcResponse::Pong => Ok(()),
            other => Err(WireError::Transport(format!(
                "unexpected ping response: {other:?}"
            ))),
        }
    }

    /// Ask the agent to exit. Returns `true` only when the `shutdown_ack`
    /// arrives in time; the caller falls through to the force-stop path
    /// otherwise.
    pub async fn shutdown(&mut self) -> bool {
        match self.call(&RpcRequest::Shutdown, SHUTDOWN_ACK_TIMEOUT).await {
            Ok(RpcResponse::ShutdownAck) => true,
            Ok(other) => {
                warn!("Unexpected shutdown response: {other:?}");
                false
            }
            Err(e) => {
                warn!("Shutdown request failed: {e}");
                false
            }
        }
    }

    /// Close the socket. Errors are ignored — the peer may already be gone.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn send_json(&mut self, text: &str) -> Result<(), WireError> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| WireError::Transport(format!("send: {e}")))
    }

    /// Read frames until the next parseable response, bounded by `timeout`.
    async fn next_response(&mut self, timeout: Duration) -> Result<RpcResponse, WireError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(WireError::Timeout {
                    seconds: timeout.as_secs(),
                })?;
            let frame = tokio::time::timeout(remaining, self.ws.next())
                .await
                .map_err(|_| WireError::Timeout {
                    seconds: timeout.as_secs(),
                })?;
            match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(response) => return Ok(response),
                    Err(e) => warn!("Skipping unparseable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(WireError::Transport("connection closed".into()));
                }
                Some(Ok(_)) => {} // binary/ping/pong control frames
                Some(Err(e)) => return Err(WireError::Transport(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcResult;
    use tokio::net::TcpListener;

    /// Minimal in-process agent stand-in: accepts one connection, answers the
    /// auth frame, then replies per the supplied script.
    async fn spawn_stub<F>(script: F) -> u16
    where
        F: FnOnce(Vec<serde_json::Value>) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // Auth handshake.
            let auth = ws.next().await.unwrap().unwrap();
            let auth: serde_json::Value =
                serde_json::from_str(auth.to_text().unwrap()).unwrap();
            if auth["token"] == "wrong" {
                ws.send(Message::Text(
                    r#"{"type":"error","code":"unauthorized","message":"Authentication failed"}"#
                        .to_string(),
                ))
                .await
                .unwrap();
                return;
            }
            ws.send(Message::Text(r#"{"type":"authenticated"}"#.to_string()))
                .await
                .unwrap();

            // Read one request, emit the scripted replies.
            let frame = ws.next().await.unwrap().unwrap();
            let request: serde_json::Value =
                serde_json::from_str(frame.to_text().unwrap()).unwrap();
            for reply in script(vec![request]) {
                ws.send(Message::Text(reply)).await.unwrap();
            }
            // Keep the connection open until the client drops it.
            while ws.next().await.is_some() {}
        });
        port
    }

    #[tokio::test]
    async fn authenticates_and_correlates_by_request_id() {
        let port = spawn_stub(|requests| {
            let id = requests[0]["request_id"].as_str().unwrap().to_string();
            vec![
                // An unsolicited frame for some other request comes first.
                r#"{"type":"result","request_id":"other","success":true,"output":"stale"}"#
                    .to_string(),
                format!(
                    r#"{{"type":"result","request_id":"{id}","success":true,"output":"hello","exit_code":0}}"#
                ),
            ]
        })
        .await;

        let mut wire = WireClient::connect(port, Some("secret")).await.unwrap();
        let response = wire
            .call(
                &RpcRequest::Exec {
                    request_id: "req-1".into(),
                    command: "printf hello".into(),
                    working_dir: None,
                    timeout_secs: None,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match response {
            RpcResponse::Result(RpcResult { output, exit_code, .. }) => {
                assert_eq!(output.as_deref(), Some("hello"));
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_bad_token() {
        let port = spawn_stub(|_| vec![]).await;
        let result = WireClient::connect(port, Some("wrong")).await;
        assert!(matches!(result, Err(WireError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout_not_transport() {
        let port = spawn_stub(|_| vec![]).await; // never replies to the call
        let mut wire = WireClient::connect(port, None).await.unwrap();
        let result = wire
            .call(
                &RpcRequest::ReadFile {
                    request_id: "req-2".into(),
                    path: "/etc/hostname".into(),
                },
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(WireError::Timeout { .. })));
    }

    #[tokio::test]
    async fn ping_matches_pong() {
        let port = spawn_stub(|_| vec![r#"{"type":"pong"}"#.to_string()]).await;
        let mut wire = WireClient::connect(port, None).await.unwrap();
        wire.ping().await.unwrap();
    }
}
