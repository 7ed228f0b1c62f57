//! Staging and launch of the on-host agent.
//!
//! The agent crate is embedded into this binary at compile time (manifest +
//! single source file) together with the launcher script. Deploying a session
//! means: create the remote session directory, stage the three files locally,
//! upload them with one `scp -r` call, and run `deploy.sh`, which installs a
//! toolchain if needed, builds the agent, daemonizes it, and waits for the
//! port to come up.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::error::HostError;
use crate::registry::HostConfig;

use super::ssh;

/// Staged agent files, embedded from the `agent/` crate.
const AGENT_MANIFEST: &str = include_str!("../../../agent/Cargo.toml");
const AGENT_SOURCE: &str = include_str!("../../../agent/remote_server.rs");
const LAUNCHER: &str = include_str!("deploy.sh");

/// First deploys may install rustup and compile the agent from scratch.
const LAUNCHER_TIMEOUT: Duration = Duration::from_secs(600);

/// deploy.sh exit codes (kept in sync with the script).
const EXIT_TOOLCHAIN: i32 = 5;
const EXIT_BUILD: i32 = 6;
const EXIT_NOT_READY: i32 = 7;

/// Stage agent files into `remote_dir` and run the launcher.
pub async fn deploy(
    config: &HostConfig,
    remote_dir: &str,
    use_tmux: bool,
) -> Result<(), HostError> {
    info!(
        "Deploying agent to {}:{remote_dir} (port={}, token={})",
        config.ssh_target,
        config.remote_port,
        if config.auth_token.is_some() { "***" } else { "none" }
    );

    // -- 1. Create the remote session directory ---------------------------
    let mkdir = format!("mkdir -p {}", ssh::sh_quote(remote_dir));
    let output = ssh::exec_status(config, &mkdir, Duration::from_secs(30))
        .await
        .map_err(|e| HostError::StageFailed(e.to_string()))?;
    if output.exit_code != 0 {
        return Err(HostError::StageFailed(format!(
            "mkdir exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }

    // -- 2. Stage files locally --------------------------------------------
    let staging = tempfile::tempdir()
        .map_err(|e| HostError::StageFailed(format!("local staging dir: {e}")))?;
    let files = stage_files(staging.path())?;

    // -- 3. Upload everything in one scp call ------------------------------
    ssh::scp_upload(config, &files, remote_dir).await?;

    // -- 4. Run the launcher ------------------------------------------------
    let mut launcher = format!(
        "bash {} --port {}",
        ssh::sh_quote(&format!("{remote_dir}/deploy.sh")),
        config.remote_port
    );
    if let Some(token) = &config.auth_token {
        launcher.push_str(&format!(" --token {}", ssh::sh_quote(token)));
    }
    if !use_tmux {
        launcher.push_str(" --no-tmux");
    }

    info!("Running deploy.sh on {}...", config.ssh_target);
    let output = ssh::exec_status(config, &launcher, LAUNCHER_TIMEOUT)
        .await
        .map_err(|e| HostError::LauncherFailed(e.to_string()))?;

    match output.exit_code {
        0 => {
            info!("Agent ready: {}", output.stdout.trim());
            Ok(())
        }
        EXIT_NOT_READY => Err(HostError::ReadinessTimeout(tail_of(&output.stderr, 20))),
        EXIT_TOOLCHAIN | EXIT_BUILD => Err(HostError::LauncherFailed(tail_of(&output.stderr, 20))),
        code => Err(HostError::LauncherFailed(format!(
            "deploy.sh exited {code}: {}",
            tail_of(&output.stderr, 20)
        ))),
    }
}

/// Write the embedded agent files into `dir`, returning the staged paths.
fn stage_files(dir: &std::path::Path) -> Result<Vec<PathBuf>, HostError> {
    let entries: [(&str, &str); 3] = [
        ("Cargo.toml", AGENT_MANIFEST),
        ("remote_server.rs", AGENT_SOURCE),
        ("deploy.sh", LAUNCHER),
    ];
    let mut staged = Vec::with_capacity(entries.len());
    for (name, content) in entries {
        let path = dir.join(name);
        std::fs::write(&path, content)
            .map_err(|e| HostError::StageFailed(format!("stage {name}: {e}")))?;
        staged.push(path);
    }
    Ok(staged)
}

/// Last `lines` lines of a command's captured stderr.
fn tail_of(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_assets_are_complete() {
        assert!(AGENT_MANIFEST.contains("hostlink-agent"));
        assert!(AGENT_SOURCE.contains("fn main"));
        assert!(LAUNCHER.starts_with("#!/usr/bin/env bash"));
        assert!(LAUNCHER.contains("--port"));
    }

    #[test]
    fn stage_files_writes_all_three() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path()).unwrap();
        assert_eq!(staged.len(), 3);
        for path in &staged {
            assert!(path.exists());
        }
    }

    #[test]
    fn tail_keeps_only_last_lines() {
        let text = (1..=30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tail = tail_of(&text, 5);
        assert!(tail.starts_with("line 26"));
        assert!(tail.ends_with("line 30"));
    }
}
