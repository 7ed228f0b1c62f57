//! Remote execution backend: forwards the capability set over a
//! [`RemoteHost`]'s RPC channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::HostError;
use crate::protocol::{RpcRequest, RpcResult};
use crate::remote::{RemoteHost, DEFAULT_RPC_TIMEOUT};

use super::ExecutionBackend;

/// Extra wire allowance on top of the command's own timeout, so the agent
/// can report its timeout result instead of the wire giving up first.
const EXEC_WIRE_MARGIN: Duration = Duration::from_secs(10);

pub struct RemoteBackend {
    host: Arc<RemoteHost>,
    /// Default working directory from the host's registry entry.
    workspace: Option<String>,
}

impl RemoteBackend {
    pub fn new(host: Arc<RemoteHost>, workspace: Option<String>) -> Self {
        RemoteBackend { host, workspace }
    }

    fn request_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout: Duration,
    ) -> Result<RpcResult, HostError> {
        let working_dir = working_dir
            .map(str::to_string)
            .or_else(|| self.workspace.clone());
        self.host
            .rpc(
                RpcRequest::Exec {
                    request_id: Self::request_id(),
                    command: command.to_string(),
                    working_dir,
                    timeout_secs: Some(timeout.as_secs()),
                },
                timeout + EXEC_WIRE_MARGIN,
            )
            .await
    }

    async fn read_file(&self, path: &str) -> Result<RpcResult, HostError> {
        self.host
            .rpc(
                RpcRequest::ReadFile {
                    request_id: Self::request_id(),
                    path: path.to_string(),
                },
                DEFAULT_RPC_TIMEOUT,
            )
            .await
    }

    async fn read_bytes(&self, path: &str) -> Result<RpcResult, HostError> {
        self.host
            .rpc(
                RpcRequest::ReadBytes {
                    request_id: Self::request_id(),
                    path: path.to_string(),
                },
                DEFAULT_RPC_TIMEOUT,
            )
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<RpcResult, HostError> {
        self.host
            .rpc(
                RpcRequest::WriteFile {
                    request_id: Self::request_id(),
                    path: path.to_string(),
                    content: content.to_string(),
                },
                DEFAULT_RPC_TIMEOUT,
            )
            .await
    }

    async fn edit_file(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<RpcResult, HostError> {
        self.host
            .rpc(
                RpcRequest::EditFile {
                    request_id: Self::request_id(),
                    path: path.to_string(),
                    old_text: old_text.to_string(),
                    new_text: new_text.to_string(),
                },
                DEFAULT_RPC_TIMEOUT,
            )
            .await
    }

    async fn list_dir(&self, path: &str) -> Result<RpcResult, HostError> {
        self.host
            .rpc(
                RpcRequest::ListDir {
                    request_id: Self::request_id(),
                    path: path.to_string(),
                },
                DEFAULT_RPC_TIMEOUT,
            )
            .await
    }
}
