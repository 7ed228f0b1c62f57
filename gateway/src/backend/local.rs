//! Local execution backend: same capability set as the remote side, served
//! by the gateway process itself.
//!
//! File semantics deliberately mirror the agent's handlers — size-capped
//! UTF-8 reads, atomic writes, unique-match edits — so a tool behaves the
//! same whether or not a `host` was given.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::process::Command;

use crate::error::HostError;
use crate::protocol::{DirEntry, RpcResult};

use super::ExecutionBackend;

/// Files larger than this are refused by `read_file` (5 MiB).
const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

pub struct LocalBackend {
    /// Default working directory for commands and base for relative paths.
    workspace: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        LocalBackend { workspace }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            return p;
        }
        match &self.workspace {
            Some(ws) => ws.join(p),
            None => p,
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout: Duration,
    ) -> Result<RpcResult, HostError> {
        let cwd = working_dir
            .map(PathBuf::from)
            .or_else(|| self.workspace.clone());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(RpcResult::failure(format!("failed to spawn shell: {e}"))),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                Ok(RpcResult {
                    success: exit_code == 0,
                    output: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                    error: if stderr.is_empty() { None } else { Some(stderr) },
                    exit_code: Some(exit_code),
                    ..RpcResult::default()
                })
            }
            Ok(Err(e)) => Ok(RpcResult::failure(format!("wait failed: {e}"))),
            Err(_) => Ok(RpcResult {
                success: false,
                error: Some(format!(
                    "Command timed out after {} seconds",
                    timeout.as_secs()
                )),
                exit_code: Some(-1),
                ..RpcResult::default()
            }),
        }
    }

    async fn read_file(&self, path: &str) -> Result<RpcResult, HostError> {
        let resolved = self.resolve(path);
        Ok(read_file_capped(&resolved, path).await)
    }

    async fn read_bytes(&self, path: &str) -> Result<RpcResult, HostError> {
        let resolved = self.resolve(path);
        let result = match tokio::fs::read(&resolved).await {
            Ok(bytes) => RpcResult {
                success: true,
                size: Some(bytes.len() as u64),
                content_b64: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                path: Some(resolved.to_string_lossy().into_owned()),
                ..RpcResult::default()
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                RpcResult::failure(format!("File not found: {path}"))
            }
            Err(e) => RpcResult::failure(format!("Error reading file: {e}")),
        };
        Ok(result)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<RpcResult, HostError> {
        let resolved = self.resolve(path);
        Ok(atomic_write(&resolved, content.as_bytes()).await)
    }

    async fn edit_file(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<RpcResult, HostError> {
        let resolved = self.resolve(path);
        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RpcResult::failure(format!("File not found: {path}")));
            }
            Err(e) => return Ok(RpcResult::failure(format!("Error reading file: {e}"))),
        };

        let result = match apply_edit(&content, old_text, new_text) {
            Ok(updated) => {
                let written = atomic_write(&resolved, updated.as_bytes()).await;
                if written.success {
                    RpcResult {
                        success: true,
                        path: Some(resolved.to_string_lossy().into_owned()),
                        ..RpcResult::default()
                    }
                } else {
                    written
                }
            }
            Err(e) => RpcResult::failure(e.describe(path)),
        };
        Ok(result)
    }

    async fn list_dir(&self, path: &str) -> Result<RpcResult, HostError> {
        let resolved = self.resolve(path);
        Ok(list_directory(&resolved, path).await)
    }
}

/// UTF-8 file read with the shared size cap.
pub(crate) async fn read_file_capped(resolved: &Path, display: &str) -> RpcResult {
    let metadata = match tokio::fs::metadata(resolved).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RpcResult::failure(format!("File not found: {display}"));
        }
        Err(e) => return RpcResult::failure(format!("Error reading file: {e}")),
    };
    if metadata.is_dir() {
        return RpcResult::failure(format!("Not a file: {display}"));
    }
    if metadata.len() > MAX_READ_BYTES {
        return RpcResult::failure(format!(
            "File too large ({} bytes, max {MAX_READ_BYTES})",
            metadata.len()
        ));
    }
    match tokio::fs::read(resolved).await {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => RpcResult {
                success: true,
                content: Some(text),
                ..RpcResult::default()
            },
            Err(e) => RpcResult {
                success: true,
                content: Some(String::from_utf8_lossy(e.as_bytes()).into_owned()),
                ..RpcResult::default()
            },
        },
        Err(e) => RpcResult::failure(format!("Error reading file: {e}")),
    }
}

/// Write via a temp sibling + fsync + rename so concurrent readers see either
/// the full pre-image or the full post-image. Creates parent directories.
pub(crate) async fn atomic_write(resolved: &Path, bytes: &[u8]) -> RpcResult {
    let parent = match resolved.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if let Err(e) = tokio::fs::create_dir_all(&parent).await {
        return RpcResult::failure(format!("Error creating parent directories: {e}"));
    }

    let resolved = resolved.to_path_buf();
    let bytes = bytes.to_vec();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&resolved).map_err(|e| e.error)?;
        Ok(bytes.len() as u64)
    })
    .await;

    match result {
        Ok(Ok(written)) => RpcResult {
            success: true,
            bytes: Some(written),
            ..RpcResult::default()
        },
        Ok(Err(e)) => RpcResult::failure(format!("Error writing file: {e}")),
        Err(e) => RpcResult::failure(format!("write task failed: {e}")),
    }
}

/// Non-recursive listing with typed entries, sorted by name.
pub(crate) async fn list_directory(resolved: &Path, display: &str) -> RpcResult {
    let mut read_dir = match tokio::fs::read_dir(resolved).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RpcResult::failure(format!("Directory not found: {display}"));
        }
        Err(e) => return RpcResult::failure(format!("Error listing directory: {e}")),
    };

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().await.ok();
        let metadata = entry.metadata().await.ok();

        let entry_type = match file_type {
            Some(t) if t.is_symlink() => "symlink",
            Some(t) if t.is_dir() => "dir",
            Some(t) if t.is_file() => "file",
            _ => "other",
        };
        let size = metadata.as_ref().map_or(0, std::fs::Metadata::len);
        let mtime = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        entries.push(DirEntry {
            name,
            entry_type: entry_type.to_string(),
            size,
            mtime,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    RpcResult {
        success: true,
        entries: Some(entries),
        ..RpcResult::default()
    }
}

/// Why an edit could not be applied.
pub(crate) enum EditError {
    /// `old_text` does not occur at all.
    NotFound,
    /// `old_text` occurs more than once.
    NotUnique(usize),
    /// No exact occurrence, but a whitespace-insensitive match exists.
    Ambiguous { line: usize },
}

impl EditError {
    pub(crate) fn describe(&self, path: &str) -> String {
        match self {
            EditError::NotFound => format!("old_text not found in {path}"),
            EditError::NotUnique(count) => {
                format!("old_text appears {count} times in {path}; provide more context")
            }
            EditError::Ambiguous { line } => format!(
                "old_text not found exactly in {path}; a near match at line {line} \
                 differs in whitespace"
            ),
        }
    }
}

/// Replace a uniquely-occurring `old_text` with `new_text`.
pub(crate) fn apply_edit(content: &str, old_text: &str, new_text: &str) -> Result<String, EditError> {
    let count = content.matches(old_text).count();
    match count {
        1 => Ok(content.replacen(old_text, new_text, 1)),
        0 => {
            // Near-miss scan: compare trimmed line sequences so a copy-paste
            // with mangled indentation gets a pointed error.
            let needle: Vec<&str> = old_text.lines().map(str::trim).collect();
            if !needle.is_empty() {
                let haystack: Vec<&str> = content.lines().map(str::trim).collect();
                for start in 0..haystack.len().saturating_sub(needle.len() - 1) {
                    if haystack[start..start + needle.len()] == needle[..] {
                        return Err(EditError::Ambiguous { line: start + 1 });
                    }
                }
            }
            Err(EditError::NotFound)
        }
        n => Err(EditError::NotUnique(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LocalBackend {
        LocalBackend::new(None)
    }

    #[tokio::test]
    async fn exec_reports_true_exit_codes() {
        let b = backend();
        for code in [0, 1, 2, 137] {
            let result = b
                .exec(&format!("exit {code}"), None, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.exit_code, Some(code), "exit {code}");
            assert_eq!(result.success, code == 0);
        }
    }

    #[tokio::test]
    async fn exec_captures_output_and_respects_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let b = backend();
        let result = b
            .exec("pwd", Some(dir.path().to_str().unwrap()), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
        let cwd = result.output.unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(cwd.trim(), canonical.to_str().unwrap());
    }

    #[tokio::test]
    async fn exec_timeout_is_an_application_error() {
        let b = backend();
        let result = b
            .exec("sleep 5", None, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("x.txt");
        let path = path.to_str().unwrap();
        let b = backend();

        let written = b.write_file(path, "A").await.unwrap();
        assert!(written.success);
        assert_eq!(written.bytes, Some(1));

        let read = b.read_file(path).await.unwrap();
        assert_eq!(read.content.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "A B A").unwrap();
        let path = path.to_str().unwrap();
        let b = backend();

        let result = b.edit_file(path, "A", "C").await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("2 times"));

        let result = b.edit_file(path, "B", "BBB").await.unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "A BBB A");

        // The old text is gone now; a repeat edit fails with not-found.
        let result = b.edit_file(path, "B ", "?").await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn list_dir_types_and_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();
        std::fs::write(dir.path().join("afile"), b"hi").unwrap();
        let b = backend();

        let result = b.list_dir(dir.path().to_str().unwrap()).await.unwrap();
        let entries = result.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "afile");
        assert_eq!(entries[0].entry_type, "file");
        assert_eq!(entries[0].size, 2);
        assert_eq!(entries[1].name, "zdir");
        assert_eq!(entries[1].entry_type, "dir");
    }

    #[test]
    fn apply_edit_flags_whitespace_near_miss() {
        let content = "fn main() {\n    println!(\"hi\");\n}\n";
        let err = apply_edit(content, "fn main() {\n  println!(\"hi\");", "x").unwrap_err();
        match err {
            EditError::Ambiguous { line } => assert_eq!(line, 1),
            _ => panic!("expected ambiguous match"),
        }
    }
}
