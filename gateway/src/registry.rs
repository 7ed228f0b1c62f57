//! Persisted registry of remote host configurations.
//!
//! The registry lives at `<user-config>/hostlink/hosts.json` (override the
//! directory with `HOSTLINK_CONFIG_DIR`) and is rewritten atomically on every
//! mutation: the new content goes to a temp file in the same directory, is
//! fsynced, and renamed over the old file. A corrupt file is quarantined with
//! a `.bak` suffix rather than deleted, and the registry starts empty.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HostError;

/// Configuration for a single remote host. Immutable after registration
/// except for `local_port` (assigned at connect time) and `active_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Unique name, also the key in the registry file.
    #[serde(default)]
    pub name: String,
    /// SSH destination in `user@host` form.
    pub ssh_target: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    /// Port the agent binds on the remote loopback.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Local end of the SSH forward, assigned when the tunnel opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Default working directory for commands on this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Resumable session descriptor, present while an agent is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_session: Option<ActiveSession>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_port() -> u16 {
    8765
}

impl HostConfig {
    pub fn new(name: impl Into<String>, ssh_target: impl Into<String>) -> Self {
        HostConfig {
            name: name.into(),
            ssh_target: ssh_target.into(),
            ssh_port: default_ssh_port(),
            ssh_key_path: None,
            remote_port: default_remote_port(),
            local_port: None,
            auth_token: None,
            workspace: None,
            active_session: None,
        }
    }
}

/// Everything needed to rebind to a deployed agent after a gateway restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveSession {
    pub session_id: String,
    pub remote_dir: String,
    pub remote_port: u16,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// On-disk shape: `{"hosts": {"<name>": {...}}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    hosts: BTreeMap<String, HostConfig>,
}

/// In-memory registry bound to its backing file.
#[derive(Debug)]
pub struct HostRegistry {
    hosts: BTreeMap<String, HostConfig>,
    path: PathBuf,
}

impl HostRegistry {
    /// Default registry path: `<user-config>/hostlink/hosts.json`, with
    /// `HOSTLINK_CONFIG_DIR` taking precedence when set.
    pub fn default_path() -> PathBuf {
        if let Ok(dir) = std::env::var("HOSTLINK_CONFIG_DIR") {
            return PathBuf::from(dir).join("hosts.json");
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hostlink")
            .join("hosts.json")
    }

    /// Load the registry from `path`, creating an empty one if the file does
    /// not exist. A file that fails to parse is moved aside to `<path>.bak`
    /// and the registry starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hosts = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => match serde_json::from_str::<RegistryFile>(&text) {
                Ok(file) => {
                    let mut hosts = file.hosts;
                    // The map key is authoritative for the name.
                    for (name, config) in &mut hosts {
                        config.name = name.clone();
                    }
                    hosts
                }
                Err(e) => {
                    let backup = path.with_extension("json.bak");
                    warn!(
                        "Corrupt registry at {}: {e}; preserving as {}",
                        path.display(),
                        backup.display()
                    );
                    if let Err(e) = std::fs::rename(&path, &backup) {
                        warn!("Failed to preserve corrupt registry: {e}");
                    }
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        HostRegistry { hosts, path }
    }

    /// Register a new host. Fails if the name is taken.
    pub fn add(&mut self, config: HostConfig) -> Result<(), HostError> {
        if config.name.is_empty() {
            return Err(HostError::Persistence("host name must not be empty".into()));
        }
        if self.hosts.contains_key(&config.name) {
            return Err(HostError::AlreadyExists(config.name));
        }
        self.hosts.insert(config.name.clone(), config);
        self.save()
    }

    /// Remove a host by name.
    pub fn remove(&mut self, name: &str) -> Result<HostConfig, HostError> {
        let config = self
            .hosts
            .remove(name)
            .ok_or_else(|| HostError::HostNotFound(name.to_string()))?;
        self.save()?;
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.get(name)
    }

    pub fn list(&self) -> Vec<HostConfig> {
        self.hosts.values().cloned().collect()
    }

    /// Persist a session descriptor for `name` so it can be resumed after a
    /// gateway restart. Also records the session's local port on the config.
    pub fn save_session(&mut self, name: &str, session: ActiveSession) -> Result<(), HostError> {
        let config = self
            .hosts
            .get_mut(name)
            .ok_or_else(|| HostError::HostNotFound(name.to_string()))?;
        config.local_port = Some(session.local_port);
        config.active_session = Some(session);
        self.save()?;
        info!("Saved session for host '{name}'");
        Ok(())
    }

    /// Drop the persisted session for `name`. Called only after a successful
    /// teardown — a failed resume keeps the entry so later attempts can
    /// still rebind.
    pub fn clear_session(&mut self, name: &str) -> Result<(), HostError> {
        let config = self
            .hosts
            .get_mut(name)
            .ok_or_else(|| HostError::HostNotFound(name.to_string()))?;
        if config.active_session.take().is_some() {
            self.save()?;
            info!("Cleared session for host '{name}'");
        }
        Ok(())
    }

    /// Atomically rewrite the backing file: temp file in the same directory,
    /// fsync, rename.
    pub fn save(&self) -> Result<(), HostError> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .map_err(|e| HostError::Persistence(format!("create {}: {e}", parent.display())))?;

        let file = RegistryFile {
            hosts: self.hosts.clone(),
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| HostError::Persistence(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| HostError::Persistence(format!("temp file: {e}")))?;
        tmp.write_all(text.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| HostError::Persistence(format!("write: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| HostError::Persistence(format!("rename: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_in(dir: &tempfile::TempDir) -> HostRegistry {
        HostRegistry::load(dir.path().join("hosts.json"))
    }

    #[test]
    fn add_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_in(&dir);
        reg.add(HostConfig::new("build", "user@10.0.0.5")).unwrap();

        let got = reg.get("build").unwrap();
        assert_eq!(got.ssh_target, "user@10.0.0.5");
        assert_eq!(got.ssh_port, 22);
        assert_eq!(got.remote_port, 8765);

        assert!(matches!(
            reg.add(HostConfig::new("build", "other@host")),
            Err(HostError::AlreadyExists(_))
        ));

        reg.remove("build").unwrap();
        assert!(reg.get("build").is_none());
        assert!(matches!(
            reg.remove("build"),
            Err(HostError::HostNotFound(_))
        ));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut reg = registry_in(&dir);
            let mut config = HostConfig::new("s", "u@h");
            config.workspace = Some("/srv/app".into());
            reg.add(config).unwrap();
            reg.save_session(
                "s",
                ActiveSession {
                    session_id: "hostlink-abc123de".into(),
                    remote_dir: "/tmp/hostlink-abc123de".into(),
                    remote_port: 8765,
                    local_port: 40123,
                    auth_token: None,
                },
            )
            .unwrap();
        }

        let reg = registry_in(&dir);
        let config = reg.get("s").unwrap();
        assert_eq!(config.workspace.as_deref(), Some("/srv/app"));
        let session = config.active_session.as_ref().unwrap();
        assert_eq!(session.session_id, "hostlink-abc123de");
        assert_eq!(config.local_port, Some(40123));
    }

    #[test]
    fn clear_session_only_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_in(&dir);
        reg.add(HostConfig::new("s", "u@h")).unwrap();
        reg.save_session(
            "s",
            ActiveSession {
                session_id: "hostlink-00000000".into(),
                remote_dir: "/tmp/hostlink-00000000".into(),
                remote_port: 8765,
                local_port: 40000,
                auth_token: None,
            },
        )
        .unwrap();

        reg.clear_session("s").unwrap();
        let config = reg.get("s").unwrap();
        assert!(config.active_session.is_none());
        assert_eq!(config.ssh_target, "u@h");
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, "{not json").unwrap();

        let reg = HostRegistry::load(&path);
        assert!(reg.list().is_empty());
        assert!(dir.path().join("hosts.json.bak").exists());
    }

    #[test]
    fn name_key_wins_over_embedded_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(
            &path,
            r#"{"hosts": {"real": {"name": "stale", "ssh_target": "u@h"}}}"#,
        )
        .unwrap();

        let reg = HostRegistry::load(&path);
        assert_eq!(reg.get("real").unwrap().name, "real");
    }
}
