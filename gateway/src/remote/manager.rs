//! Pool of [`RemoteHost`] connections keyed by registered name.
//!
//! The manager is the only writer of the registry file: sessions are
//! persisted when a connection is established and cleared only after a
//! successful teardown. A failed resume leaves the persisted session in
//! place — the network may recover and a later attempt may still rebind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::HostError;
use crate::registry::{HostConfig, HostRegistry};

use super::host::RemoteHost;

/// What `connect` actually did, for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The existing connection answered a ping.
    AlreadyConnected,
    /// A persisted session was rebound without redeploying.
    Resumed,
    /// A fresh agent was deployed under a new session id.
    NewSession,
}

/// Lifecycle manager for remote host connections.
pub struct HostManager {
    registry: Mutex<HostRegistry>,
    connections: Mutex<HashMap<String, Arc<RemoteHost>>>,
}

impl HostManager {
    pub fn new(registry: HostRegistry) -> Self {
        HostManager {
            registry: Mutex::new(registry),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a host. Does not connect.
    pub async fn add_host(&self, config: HostConfig) -> Result<(), HostError> {
        self.registry.lock().await.add(config)
    }

    /// Disconnect (if connected) and unregister a host.
    ///
    /// When teardown fails the registry entry is kept — along with its
    /// resumable session — unless `force` is set.
    pub async fn remove_host(&self, name: &str, force: bool) -> Result<(), HostError> {
        let host = self.connections.lock().await.remove(name);
        if let Some(host) = host {
            match host.teardown().await {
                Ok(()) => {
                    let _ = self.registry.lock().await.clear_session(name);
                }
                Err(e) if force => {
                    warn!("Teardown of '{name}' failed ({e}); removing anyway (force)");
                }
                Err(e) => {
                    // Put the handle back so a later disconnect can retry.
                    self.connections
                        .lock()
                        .await
                        .insert(name.to_string(), host);
                    return Err(e);
                }
            }
        }
        self.registry.lock().await.remove(name)?;
        Ok(())
    }

    /// Explicit user-initiated connect: verify an existing connection with a
    /// ping, or establish one (resume first, deploy as fallback).
    pub async fn connect(&self, name: &str) -> Result<(ConnectOutcome, Arc<RemoteHost>), HostError> {
        let config = self.config_for(name).await?;

        let existing = self.connections.lock().await.get(name).cloned();
        if let Some(host) = existing {
            if host.ping().await {
                return Ok((ConnectOutcome::AlreadyConnected, host));
            }
            // Unhealthy — drop the handle and reconnect. The remote
            // idempotency cache is per-connection, so the fresh wire starts
            // clean.
            warn!("Host '{name}' failed ping, reconnecting");
            self.disconnect(name).await.ok();
        }

        self.resume_or_deploy(name, config).await
    }

    /// Implicit connect used by the backend router. An in-memory host is
    /// returned as-is — `RemoteHost::rpc` auto-heals its own transport, so
    /// no ping is spent here.
    pub async fn get_or_connect(&self, name: &str) -> Result<Arc<RemoteHost>, HostError> {
        let config = self.config_for(name).await?;

        if let Some(host) = self.connections.lock().await.get(name) {
            return Ok(Arc::clone(host));
        }

        let (_, host) = self.resume_or_deploy(name, config).await?;
        Ok(host)
    }

    /// Tear down and forget the named connection. Returns `false` when the
    /// host was not connected. The persisted session is cleared only when
    /// teardown succeeded.
    pub async fn disconnect(&self, name: &str) -> Result<bool, HostError> {
        let host = self.connections.lock().await.remove(name);
        let Some(host) = host else {
            return Ok(false);
        };
        match host.teardown().await {
            Ok(()) => {
                let _ = self.registry.lock().await.clear_session(name);
                Ok(true)
            }
            Err(e) => {
                warn!("Teardown of '{name}' failed: {e}; keeping persisted session");
                Err(e)
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                warn!("Disconnect of '{name}' failed: {e}");
            }
        }
    }

    /// Every registered host with its live-connection flag.
    pub async fn list(&self) -> Vec<(HostConfig, bool)> {
        let configs = self.registry.lock().await.list();
        let connections = self.connections.lock().await;
        let mut out = Vec::with_capacity(configs.len());
        for config in configs {
            let connected = match connections.get(&config.name) {
                Some(host) => host.is_connected().await,
                None => false,
            };
            out.push((config, connected));
        }
        out
    }

    pub async fn get_config(&self, name: &str) -> Option<HostConfig> {
        self.registry.lock().await.get(name).cloned()
    }

    async fn config_for(&self, name: &str) -> Result<HostConfig, HostError> {
        self.registry
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::HostNotFound(name.to_string()))
    }

    /// Try to rebind a persisted session; fall back to a fresh deploy. The
    /// fresh session is persisted for future resumes.
    async fn resume_or_deploy(
        &self,
        name: &str,
        config: HostConfig,
    ) -> Result<(ConnectOutcome, Arc<RemoteHost>), HostError> {
        if let Some(recorded) = config.active_session.clone() {
            info!(
                "Attempting to resume session {} on '{name}'",
                recorded.session_id
            );
            let host = Arc::new(RemoteHost::new(config.clone()));
            match host.resume(recorded).await {
                Ok(()) => {
                    self.connections
                        .lock()
                        .await
                        .insert(name.to_string(), Arc::clone(&host));
                    return Ok((ConnectOutcome::Resumed, host));
                }
                Err(e) => {
                    // Keep active_session on disk: the agent may still be
                    // alive behind a transient network failure.
                    warn!("Resume failed for '{name}': {e}; deploying fresh session");
                }
            }
        }

        let host = Arc::new(RemoteHost::new(config));
        let session = host.setup().await?;
        self.registry
            .lock()
            .await
            .save_session(name, session)?;
        self.connections
            .lock()
            .await
            .insert(name.to_string(), Arc::clone(&host));
        Ok((ConnectOutcome::NewSession, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActiveSession;

    fn manager_in(dir: &tempfile::TempDir) -> HostManager {
        HostManager::new(HostRegistry::load(dir.path().join("hosts.json")))
    }

    #[tokio::test]
    async fn add_list_remove_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);

        manager
            .add_host(HostConfig::new("build", "ci@10.1.2.3"))
            .await
            .unwrap();
        let listed = manager.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.name, "build");
        assert!(!listed[0].1);

        manager.remove_host("build", false).await.unwrap();
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        manager
            .add_host(HostConfig::new("s", "u@h"))
            .await
            .unwrap();
        let err = manager
            .add_host(HostConfig::new("s", "u@other"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn unknown_host_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        let err = manager.get_or_connect("nope").await.unwrap_err();
        assert!(matches!(err, HostError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_of_unconnected_host_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        manager
            .add_host(HostConfig::new("s", "u@h"))
            .await
            .unwrap();
        assert!(!manager.disconnect("s").await.unwrap());
    }

    #[tokio::test]
    async fn remove_host_keeps_persisted_session_metadata_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        manager
            .add_host(HostConfig::new("s", "u@h"))
            .await
            .unwrap();
        // Simulate a persisted session from an earlier run.
        manager
            .registry
            .lock()
            .await
            .save_session(
                "s",
                ActiveSession {
                    session_id: "hostlink-deadbeef".into(),
                    remote_dir: "/tmp/hostlink-deadbeef".into(),
                    remote_port: 8765,
                    local_port: 40001,
                    auth_token: None,
                },
            )
            .unwrap();

        let config = manager.get_config("s").await.unwrap();
        assert!(config.active_session.is_some());

        // Not connected, so removal needs no teardown and must succeed.
        manager.remove_host("s", false).await.unwrap();
        assert!(manager.get_config("s").await.is_none());
    }
}
