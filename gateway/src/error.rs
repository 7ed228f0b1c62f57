//! Typed errors surfaced by the gateway core.
//!
//! Application-level failures (non-zero exit codes, file not found on the
//! remote, non-unique edit matches) are **not** errors here — they travel
//! back as structured results. `HostError` covers configuration, transport,
//! bootstrap, and protocol failures only.

use std::fmt;

/// Errors produced by the registry, tunnel, bootstrap, wire, and host layers.
#[derive(Debug)]
pub enum HostError {
    /// No host with that name in the registry.
    HostNotFound(String),
    /// A host with that name is already registered.
    AlreadyExists(String),
    /// The SSH leg could not be established (tunnel spawn/connect failure).
    NetworkUnreachable(String),
    /// The SSH leg is up but the agent's WebSocket did not respond.
    RemoteServerUnresponsive(String),
    /// The agent rejected the auth token.
    Unauthorized(String),
    /// Staging the agent files on the remote host failed (mkdir, local staging).
    StageFailed(String),
    /// The scp upload of staged files failed.
    UploadFailed(String),
    /// `deploy.sh` failed before the server came up (toolchain, build, spawn).
    LauncherFailed(String),
    /// The launcher daemonized the server but the port never became ready.
    ReadinessTimeout(String),
    /// A per-call RPC deadline expired. The transport is left intact.
    Timeout { seconds: u64 },
    /// The same `request_id` was reused with a different payload.
    RequestIdConflict(String),
    /// Registry file could not be read or written.
    Persistence(String),
    /// Malformed or unexpected frame on the wire.
    Protocol(String),
    /// An SSH helper command failed on the gateway side.
    Ssh(String),
}

impl HostError {
    /// Stable machine-readable code for this error, as surfaced to the
    /// router layer and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::HostNotFound(_) => "HOST_NOT_FOUND",
            HostError::AlreadyExists(_) => "ALREADY_EXISTS",
            HostError::NetworkUnreachable(_) => "NETWORK_UNREACHABLE",
            HostError::RemoteServerUnresponsive(_) => "REMOTE_SERVER_UNRESPONSIVE",
            HostError::Unauthorized(_) => "UNAUTHORIZED",
            HostError::StageFailed(_) => "STAGE_FAILED",
            HostError::UploadFailed(_) => "UPLOAD_FAILED",
            HostError::LauncherFailed(_) => "LAUNCHER_FAILED",
            HostError::ReadinessTimeout(_) => "READINESS_TIMEOUT",
            HostError::Timeout { .. } => "TIMEOUT",
            HostError::RequestIdConflict(_) => "REQUEST_ID_CONFLICT",
            HostError::Persistence(_) => "PERSISTENCE_ERROR",
            HostError::Protocol(_) => "PROTOCOL_ERROR",
            HostError::Ssh(_) => "SSH_ERROR",
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::HostNotFound(name) => write!(f, "Host not found: {name}"),
            HostError::AlreadyExists(name) => write!(f, "Host already exists: {name}"),
            HostError::NetworkUnreachable(msg) => write!(f, "Network unreachable: {msg}"),
            HostError::RemoteServerUnresponsive(msg) => {
                write!(f, "Remote server not responding: {msg}")
            }
            HostError::Unauthorized(msg) => write!(f, "Authentication failed: {msg}"),
            HostError::StageFailed(msg) => write!(f, "Failed to stage agent files: {msg}"),
            HostError::UploadFailed(msg) => write!(f, "Upload failed: {msg}"),
            HostError::LauncherFailed(msg) => write!(f, "Launcher failed: {msg}"),
            HostError::ReadinessTimeout(msg) => {
                write!(f, "Remote server did not become ready: {msg}")
            }
            HostError::Timeout { seconds } => {
                write!(f, "Request timed out after {seconds} seconds")
            }
            HostError::RequestIdConflict(id) => {
                write!(f, "request_id reused with a different payload: {id}")
            }
            HostError::Persistence(msg) => write!(f, "Registry persistence error: {msg}"),
            HostError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            HostError::Ssh(msg) => write!(f, "SSH command failed: {msg}"),
        }
    }
}

impl std::error::Error for HostError {}
