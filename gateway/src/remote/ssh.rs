//! Thin helpers around the system `ssh`/`scp` binaries.
//!
//! Everything runs in batch mode — no interactive prompting. Authentication
//! comes from the configured key file or the user's ssh-agent.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::error::HostError;
use crate::registry::HostConfig;

/// Single-quote a string for interpolation into a remote shell command.
///
/// Embedded single quotes become `'\''`.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Common `ssh` options shared by the tunnel, exec, and upload paths.
pub fn base_args(config: &HostConfig) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        config.ssh_port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
    ];
    if let Some(key) = &config.ssh_key_path {
        args.push("-i".to_string());
        args.push(key.clone());
    }
    args
}

/// Captured output of a remote command.
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run `command` on the host over SSH and capture its output.
///
/// Returns the full output regardless of exit code — callers that care about
/// failure inspect `exit_code` themselves.
pub async fn exec_status(
    config: &HostConfig,
    command: &str,
    timeout: Duration,
) -> Result<SshOutput, HostError> {
    let mut args = base_args(config);
    args.push(config.ssh_target.clone());
    args.push(command.to_string());

    let mut child = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HostError::Ssh(format!("failed to spawn ssh: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| HostError::Ssh(e.to_string()))?,
        Err(_) => {
            let preview: String = command.chars().take(80).collect();
            return Err(HostError::Ssh(format!(
                "ssh command timed out after {}s: {preview}",
                timeout.as_secs()
            )));
        }
    };

    Ok(SshOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Run `command` on the host and return trimmed stdout. Non-zero exits are
/// logged but not fatal — teardown steps are best-effort.
pub async fn exec(
    config: &HostConfig,
    command: &str,
    timeout: Duration,
) -> Result<String, HostError> {
    let output = exec_status(config, command, timeout).await?;
    if output.exit_code != 0 && !output.stderr.contains("Warning: Permanently added") {
        warn!(
            "ssh command exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(output.stdout.trim().to_string())
}

/// Upload local files to `remote_dir` on the host with a single `scp` call.
pub async fn scp_upload(
    config: &HostConfig,
    local_files: &[std::path::PathBuf],
    remote_dir: &str,
) -> Result<(), HostError> {
    // scp uses -P (uppercase) for the port, unlike ssh.
    let mut args = vec![
        "-r".to_string(),
        "-P".to_string(),
        config.ssh_port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
    ];
    if let Some(key) = &config.ssh_key_path {
        args.push("-i".to_string());
        args.push(key.clone());
    }
    for file in local_files {
        args.push(file.to_string_lossy().into_owned());
    }
    args.push(format!("{}:{}/", config.ssh_target, remote_dir));

    let output = Command::new("scp")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| HostError::UploadFailed(format!("failed to spawn scp: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HostError::UploadFailed(stderr.trim().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_wraps_plain_strings() {
        assert_eq!(sh_quote("/tmp/work dir"), "'/tmp/work dir'");
    }

    #[test]
    fn sh_quote_escapes_embedded_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn base_args_include_key_when_configured() {
        let mut config = HostConfig::new("h", "u@h");
        config.ssh_key_path = Some("/home/u/.ssh/id_ed25519".into());
        let args = base_args(&config);
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }
}
