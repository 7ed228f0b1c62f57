//! Execution backends: the one seam where local-vs-remote is decided.
//!
//! Tools and CLI commands never branch on a `host` argument themselves; they
//! ask the [`BackendRouter`] for an [`ExecutionBackend`] and call the same
//! capability set either way. Application-level failures (missing file,
//! non-unique edit, non-zero exit) come back inside the [`RpcResult`];
//! [`HostError`] is reserved for configuration and transport problems.

pub mod local;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HostError;
use crate::protocol::RpcResult;
use crate::remote::HostManager;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Capability set shared by local and remote execution.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run a shell command. `working_dir` falls back to the backend's
    /// configured workspace.
    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout: Duration,
    ) -> Result<RpcResult, HostError>;

    async fn read_file(&self, path: &str) -> Result<RpcResult, HostError>;

    /// Raw read for binary-safe comparison; content comes back base64.
    async fn read_bytes(&self, path: &str) -> Result<RpcResult, HostError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<RpcResult, HostError>;

    async fn edit_file(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<RpcResult, HostError>;

    async fn list_dir(&self, path: &str) -> Result<RpcResult, HostError>;
}

/// Resolves a `host` argument to a backend.
pub struct BackendRouter {
    manager: Arc<HostManager>,
}

impl BackendRouter {
    pub fn new(manager: Arc<HostManager>) -> Self {
        BackendRouter { manager }
    }

    /// `None` or an empty host name means local execution; anything else is
    /// routed through the host manager (connecting on first use).
    pub async fn resolve(
        &self,
        host: Option<&str>,
    ) -> Result<Box<dyn ExecutionBackend>, HostError> {
        match host {
            None | Some("") => Ok(Box::new(LocalBackend::new(None))),
            Some(name) => {
                let remote = self.manager.get_or_connect(name).await?;
                let workspace = self
                    .manager
                    .get_config(name)
                    .await
                    .and_then(|c| c.workspace);
                Ok(Box::new(RemoteBackend::new(remote, workspace)))
            }
        }
    }
}
