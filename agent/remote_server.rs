//! hostlink-agent: on-host execution server.
//!
//! Staged into `/tmp/hostlink-<session>/` by the gateway and started by
//! `deploy.sh`, this binary serves exactly one WebSocket client on loopback
//! and executes shell commands and file RPCs on its behalf. Shell state
//! (working directory, environment) persists across commands — and across
//! client reconnects — through a tmux session driven with marker-framed
//! output capture.
//!
//! This file is intentionally self-contained: it is compiled on the remote
//! host outside any workspace, so the wire-protocol shapes are duplicated
//! here rather than shared with the gateway crate.
//!
//! ```text
//! Usage: hostlink-agent --port <P> [--token <T>] [--no-tmux]
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Name of the tmux session that carries shell state.
const MUX_SESSION: &str = "hostlink";
/// Default per-exec deadline.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// `read_file` refuses files above this size (5 MiB).
const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;
/// Oldest completed idempotency entries are evicted past this count.
const IDEM_CACHE_MAX: usize = 2000;

/// Monotonic counter uniquifying atomic-write temp files.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Remote execution server for hostlink.
#[derive(Parser)]
#[command(name = "hostlink-agent", version)]
struct Cli {
    /// Port to listen on (loopback only).
    #[arg(long, default_value_t = 8765)]
    port: u16,
    /// Shared secret the client must present in its first frame.
    #[arg(long, default_value = "")]
    token: String,
    /// Run commands as one-shot processes instead of through tmux.
    #[arg(long)]
    no_tmux: bool,
}

// ---------------------------------------------------------------------------
// Wire protocol (mirrors gateway/src/protocol.rs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthFrame {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RpcRequest {
    Exec {
        request_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    ReadFile {
        request_id: String,
        path: String,
    },
    ReadBytes {
        request_id: String,
        path: String,
    },
    WriteFile {
        request_id: String,
        path: String,
        content: String,
    },
    EditFile {
        request_id: String,
        path: String,
        old_text: String,
        new_text: String,
    },
    ListDir {
        request_id: String,
        path: String,
    },
    Ping,
    Close,
    Shutdown,
}

impl RpcRequest {
    fn request_id(&self) -> Option<&str> {
        match self {
            RpcRequest::Exec { request_id, .. }
            | RpcRequest::ReadFile { request_id, .. }
            | RpcRequest::ReadBytes { request_id, .. }
            | RpcRequest::WriteFile { request_id, .. }
            | RpcRequest::EditFile { request_id, .. }
            | RpcRequest::ListDir { request_id, .. } => Some(request_id),
            RpcRequest::Ping | RpcRequest::Close | RpcRequest::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RpcResponse {
    Authenticated,
    Result(RpcResult),
    Pong,
    ShutdownAck,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RpcResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<DirEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

impl RpcResult {
    fn failure(error: impl Into<String>) -> Self {
        RpcResult {
            success: false,
            error: Some(error.into()),
            ..RpcResult::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mtime: Option<u64>,
}

/// Canonical (sorted-key) JSON used for payload fingerprints. Must stay in
/// lockstep with the gateway's implementation.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn payload_fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Single-quote a string for the shell, escaping embedded quotes.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Idempotency cache (per connection)
// ---------------------------------------------------------------------------

/// State of one tracked request id.
enum IdemState {
    /// A handler is running; waiters subscribe to the watch channel.
    InFlight(watch::Receiver<Option<RpcResult>>),
    Done(RpcResult),
}

/// Per-connection request deduplication. A retried request with the same id
/// and payload gets the original result back without re-executing; the same
/// id with a different payload is a conflict.
struct IdemCache {
    entries: HashMap<String, (String, IdemState)>,
    completed: VecDeque<String>,
}

enum IdemLookup {
    /// New request: run the handler, then call `complete`.
    Fresh(watch::Sender<Option<RpcResult>>),
    /// Result already available.
    Done(RpcResult),
    /// Another task is computing the result; await the receiver.
    Join(watch::Receiver<Option<RpcResult>>),
    /// Same id, different payload fingerprint.
    Conflict,
}

impl IdemCache {
    fn new() -> Self {
        IdemCache {
            entries: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    fn lookup(&mut self, request_id: &str, fingerprint: &str) -> IdemLookup {
        match self.entries.get(request_id) {
            Some((stored, _)) if stored != fingerprint => IdemLookup::Conflict,
            Some((_, IdemState::Done(result))) => IdemLookup::Done(result.clone()),
            Some((_, IdemState::InFlight(rx))) => IdemLookup::Join(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                self.entries.insert(
                    request_id.to_string(),
                    (fingerprint.to_string(), IdemState::InFlight(rx)),
                );
                IdemLookup::Fresh(tx)
            }
        }
    }

    fn complete(&mut self, request_id: &str, result: RpcResult) {
        if let Some(entry) = self.entries.get_mut(request_id) {
            entry.1 = IdemState::Done(result);
        }
        self.completed.push_back(request_id.to_string());
        while self.completed.len() > IDEM_CACHE_MAX {
            if let Some(old) = self.completed.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// tmux session executor
// ---------------------------------------------------------------------------

/// Drives one tmux session over a dedicated socket. Commands are wrapped
/// with unique start/end markers so output and the true exit code can be
/// extracted no matter what the prompt looks like or what the command
/// prints.
struct TmuxSession {
    socket_path: PathBuf,
}

impl TmuxSession {
    /// Create the session, killing any stale one left by a previous server
    /// instance on the same socket.
    async fn create(socket_path: PathBuf) -> Result<Self, String> {
        if let Some(dir) = socket_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("socket dir: {e}"))?;
        }
        let session = TmuxSession { socket_path };

        if session.run(&["has-session", "-t", MUX_SESSION]).await.is_ok() {
            let _ = session.run(&["kill-session", "-t", MUX_SESSION]).await;
            info!("Killed stale tmux session {MUX_SESSION}");
        }

        session
            .run(&["new-session", "-d", "-s", MUX_SESSION, "-n", "shell"])
            .await
            .map_err(|e| format!("tmux new-session failed: {e}"))?;
        info!(
            "Created tmux session {MUX_SESSION} on {}",
            session.socket_path.display()
        );
        Ok(session)
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("tmux")
            .arg("-S")
            .arg(&self.socket_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    /// Send a marker-wrapped command and poll the pane until the end marker
    /// (which embeds the exit code) appears or the deadline passes.
    async fn send_and_capture(&self, command: &str, timeout: Duration) -> RpcResult {
        let marker_id = Uuid::new_v4().simple().to_string();
        let marker_id = &marker_id[..12];
        let start_marker = format!("__HOSTLINK_START_{marker_id}__");
        let end_marker = format!("__HOSTLINK_END_{marker_id}__");

        // The bare `echo` before the end marker guarantees the marker starts
        // on its own line even when the command output lacks a trailing
        // newline.
        let wrapped = format!(
            "echo {start_marker}; {command}; __hl_ec=$?; echo; echo {end_marker}$__hl_ec"
        );

        // Literal send so the shell sees exactly what a user would type.
        if let Err(e) = self
            .run(&["send-keys", "-t", MUX_SESSION, "-l", "--", &wrapped])
            .await
        {
            return RpcResult::failure(format!("tmux send-keys failed: {e}"));
        }
        if let Err(e) = self.run(&["send-keys", "-t", MUX_SESSION, "Enter"]).await {
            return RpcResult::failure(format!("tmux send-keys failed: {e}"));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll_interval = Duration::from_millis(150);
        let mut raw = String::new();

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll_interval).await;
            raw = self.capture().await;
            if let Some((output, exit_code)) = parse_markers(&raw, &start_marker, &end_marker) {
                return RpcResult {
                    success: exit_code == 0,
                    output: Some(output),
                    exit_code: Some(exit_code),
                    error: if exit_code == 0 {
                        None
                    } else {
                        Some(format!("exit code {exit_code}"))
                    },
                    ..RpcResult::default()
                };
            }
            poll_interval = (poll_interval * 2).min(Duration::from_secs(1));
        }

        // Deadline hit. The command keeps running in the shell; report what
        // we saw so far.
        warn!(
            "Capture timed out after {}s for marker {marker_id}",
            timeout.as_secs()
        );
        RpcResult {
            success: false,
            output: Some(extract_partial(&raw, &start_marker)),
            error: Some("timeout".to_string()),
            exit_code: Some(-1),
            ..RpcResult::default()
        }
    }

    /// Full pane content including 500 lines of scrollback, wrapped lines
    /// joined.
    async fn capture(&self) -> String {
        self.run(&["capture-pane", "-p", "-J", "-t", MUX_SESSION, "-S", "-500"])
            .await
            .unwrap_or_default()
    }

    /// Graceful destroy: `exit` into the shell first, `kill-session` if it
    /// is still there.
    async fn destroy(&self) {
        let _ = self
            .run(&["send-keys", "-t", MUX_SESSION, "exit", "Enter"])
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        if self.run(&["has-session", "-t", MUX_SESSION]).await.is_ok() {
            let _ = self.run(&["kill-session", "-t", MUX_SESSION]).await;
            info!("Killed tmux session {MUX_SESSION}");
        } else {
            info!("tmux session {MUX_SESSION} exited gracefully");
        }
    }
}

/// Extract `(output, exit_code)` from captured pane text.
///
/// The echoed input line contains both marker strings, so the start-marker
/// check runs first and skips it; only the marker lines actually printed by
/// the shell frame the output.
fn parse_markers(raw: &str, start_marker: &str, end_marker: &str) -> Option<(String, i32)> {
    let mut collecting = false;
    let mut output_lines: Vec<&str> = Vec::new();
    let mut exit_code: Option<i32> = None;

    for line in raw.lines() {
        if line.contains(start_marker) {
            collecting = true;
            output_lines.clear();
            continue;
        }
        if line.contains(end_marker) {
            let suffix = line
                .split(end_marker)
                .nth(1)
                .unwrap_or("")
                .trim_start_matches('_')
                .trim();
            exit_code = Some(suffix.parse().unwrap_or(-1));
            break;
        }
        if collecting {
            output_lines.push(line);
        }
    }

    let exit_code = exit_code?;
    while output_lines.first().is_some_and(|l| l.trim().is_empty()) {
        output_lines.remove(0);
    }
    while output_lines.last().is_some_and(|l| l.trim().is_empty()) {
        output_lines.pop();
    }
    Some((output_lines.join("\n"), exit_code))
}

/// Best-effort output extraction when the end marker never showed up.
fn extract_partial(raw: &str, start_marker: &str) -> String {
    match raw.find(start_marker) {
        Some(idx) => {
            let after = &raw[idx + start_marker.len()..];
            let lines: Vec<&str> = after.trim().lines().take(200).collect();
            lines.join("\n")
        }
        None => {
            let tail_start = raw.len().saturating_sub(2000);
            raw[tail_start..].to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Command executor
// ---------------------------------------------------------------------------

/// Owns the (lazily created) tmux session for the whole server lifetime.
///
/// The session deliberately survives client disconnects — transport recovery
/// on the gateway side reconnects to the same shell, working directory
/// intact. Only `shutdown` destroys it.
struct CommandExecutor {
    use_tmux: bool,
    socket_path: PathBuf,
    mux: Mutex<Option<TmuxSession>>,
}

impl CommandExecutor {
    fn new(use_tmux: bool, socket_path: PathBuf) -> Self {
        CommandExecutor {
            use_tmux,
            socket_path,
            mux: Mutex::new(None),
        }
    }

    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout: Duration,
    ) -> RpcResult {
        let effective = match working_dir {
            Some(dir) => format!("cd {} && {{ {command}; }}", sh_quote(dir)),
            None => command.to_string(),
        };

        // One exec at a time: the tmux pane (or fallback shell) is a
        // critical section.
        let mut mux = self.mux.lock().await;
        if !self.use_tmux {
            return exec_oneshot(&effective, timeout).await;
        }

        if mux.is_none() {
            match TmuxSession::create(self.socket_path.clone()).await {
                Ok(session) => *mux = Some(session),
                Err(e) => {
                    warn!("tmux unavailable ({e}); falling back to one-shot exec");
                    return exec_oneshot(&effective, timeout).await;
                }
            }
        }
        mux.as_ref()
            .expect("created above")
            .send_and_capture(&effective, timeout)
            .await
    }

    /// Executor cleanup on server shutdown.
    async fn cleanup(&self) {
        let mut mux = self.mux.lock().await;
        if let Some(session) = mux.take() {
            session.destroy().await;
        }
    }
}

/// Fallback mode: fresh `sh -c` child per command, no state carryover.
async fn exec_oneshot(command: &str, timeout: Duration) -> RpcResult {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return RpcResult::failure(format!("failed to spawn shell: {e}")),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            RpcResult {
                success: exit_code == 0,
                output: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                error: if stderr.is_empty() { None } else { Some(stderr) },
                exit_code: Some(exit_code),
                ..RpcResult::default()
            }
        }
        Ok(Err(e)) => RpcResult::failure(format!("wait failed: {e}")),
        Err(_) => RpcResult {
            success: false,
            error: Some("timeout".to_string()),
            exit_code: Some(-1),
            ..RpcResult::default()
        },
    }
}

// ---------------------------------------------------------------------------
// File service
// ---------------------------------------------------------------------------

async fn read_file(path: &str) -> RpcResult {
    let p = Path::new(path);
    let metadata = match tokio::fs::metadata(p).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RpcResult::failure(format!("File not found: {path}"));
        }
        Err(e) => return RpcResult::failure(format!("Error reading file: {e}")),
    };
    if !metadata.is_file() {
        return RpcResult::failure(format!("Not a file: {path}"));
    }
    if metadata.len() > MAX_READ_BYTES {
        return RpcResult::failure(format!(
            "File too large ({} bytes, max {MAX_READ_BYTES})",
            metadata.len()
        ));
    }
    match tokio::fs::read(p).await {
        Ok(bytes) => {
            let content = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            };
            RpcResult {
                success: true,
                content: Some(content),
                ..RpcResult::default()
            }
        }
        Err(e) => RpcResult::failure(format!("Error reading file: {e}")),
    }
}

async fn read_bytes(path: &str) -> RpcResult {
    use base64::Engine;
    let p = Path::new(path);
    match tokio::fs::read(p).await {
        Ok(bytes) => RpcResult {
            success: true,
            size: Some(bytes.len() as u64),
            content_b64: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
            path: Some(path.to_string()),
            ..RpcResult::default()
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            RpcResult::failure(format!("File not found: {path}"))
        }
        Err(e) => RpcResult::failure(format!("Error reading file: {e}")),
    }
}

/// Atomic write: temp sibling in the same directory, fsync, rename. A
/// concurrent reader sees either the full pre-image or the full post-image.
async fn write_file(path: &str, content: &str) -> RpcResult {
    let p = PathBuf::from(path);
    let parent = match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if let Err(e) = tokio::fs::create_dir_all(&parent).await {
        return RpcResult::failure(format!("Error creating parent directories: {e}"));
    }

    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".hostlink_tmp_{}_{seq}", std::process::id()));
    let bytes = content.as_bytes().to_vec();

    let write_result = async {
        tokio::fs::write(&temp_path, &bytes).await?;
        let file = tokio::fs::OpenOptions::new().read(true).open(&temp_path).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, &p).await
    }
    .await;

    match write_result {
        Ok(()) => RpcResult {
            success: true,
            bytes: Some(bytes.len() as u64),
            path: Some(path.to_string()),
            ..RpcResult::default()
        },
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            RpcResult::failure(format!("Error writing file: {e}"))
        }
    }
}

async fn edit_file(path: &str, old_text: &str, new_text: &str) -> RpcResult {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RpcResult::failure(format!("File not found: {path}"));
        }
        Err(e) => return RpcResult::failure(format!("Error reading file: {e}")),
    };

    match apply_edit(&content, old_text, new_text) {
        Ok(updated) => {
            let written = write_file(path, &updated).await;
            if written.success {
                RpcResult {
                    success: true,
                    path: Some(path.to_string()),
                    ..RpcResult::default()
                }
            } else {
                written
            }
        }
        Err(message) => RpcResult::failure(message),
    }
}

/// Replace a uniquely-occurring `old_text`. Zero occurrences with a
/// whitespace-insensitive near match is reported separately so the caller
/// can fix indentation instead of guessing.
fn apply_edit(content: &str, old_text: &str, new_text: &str) -> Result<String, String> {
    match content.matches(old_text).count() {
        1 => Ok(content.replacen(old_text, new_text, 1)),
        0 => {
            let needle: Vec<&str> = old_text.lines().map(str::trim).collect();
            if !needle.is_empty() {
                let haystack: Vec<&str> = content.lines().map(str::trim).collect();
                for start in 0..haystack.len().saturating_sub(needle.len() - 1) {
                    if haystack[start..start + needle.len()] == needle[..] {
                        return Err(format!(
                            "old_text not found exactly; a near match at line {} differs in whitespace",
                            start + 1
                        ));
                    }
                }
            }
            Err("old_text not found".to_string())
        }
        n => Err(format!("old_text appears {n} times; provide more context")),
    }
}

async fn list_dir(path: &str) -> RpcResult {
    let mut read_dir = match tokio::fs::read_dir(path).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RpcResult::failure(format!("Directory not found: {path}"));
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

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_frame(sink: &mut WsSink, response: &RpcResponse) -> Result<(), ()> {
    let text = serde_json::to_string(response).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

async fn handle_connection(
    stream: TcpStream,
    auth_token: String,
    executor: Arc<CommandExecutor>,
    stop: watch::Sender<bool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    info!("New connection from {peer}");
    let (mut sink, mut reader) = ws.split();

    // First frame is the auth frame.
    let authed = match tokio::time::timeout(Duration::from_secs(30), reader.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<AuthFrame>(&text) {
                Ok(frame) => auth_token.is_empty() || frame.token == auth_token,
                Err(_) => false,
            }
        }
        _ => false,
    };
    if !authed {
        warn!("Authentication failed for {peer}");
        let _ = send_frame(
            &mut sink,
            &RpcResponse::Error {
                request_id: None,
                code: Some("unauthorized".into()),
                message: "Authentication failed".into(),
            },
        )
        .await;
        return;
    }
    if send_frame(&mut sink, &RpcResponse::Authenticated).await.is_err() {
        return;
    }
    info!("Authentication successful");

    // Responses from concurrent handler tasks funnel through one writer.
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(256);
    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if send_frame(&mut sink, &response).await.is_err() {
                break;
            }
        }
    });

    // Fresh cache per connection: cross-connection retries are not
    // deduplicated.
    let cache = Arc::new(Mutex::new(IdemCache::new()));

    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                info!("Connection read error: {e}");
                break;
            }
        };

        // Malformed frames poison the stream: answer with an error frame and
        // drop the connection. The server keeps running.
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                let _ = tx
                    .send(RpcResponse::Error {
                        request_id: None,
                        code: Some("invalid_json".into()),
                        message: "Failed to parse JSON message".into(),
                    })
                    .await;
                break;
            }
        };
        let request: RpcRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(e) => {
                let request_id = value["request_id"].as_str().map(String::from);
                let _ = tx
                    .send(RpcResponse::Error {
                        request_id,
                        code: Some("unknown_type".into()),
                        message: format!("Malformed request: {e}"),
                    })
                    .await;
                break;
            }
        };

        let request_id = request.request_id().map(str::to_string);
        match request_id {
            None => match request {
                RpcRequest::Ping => {
                    let _ = tx.send(RpcResponse::Pong).await;
                }
                RpcRequest::Close => {
                    info!("Client requested close; connection ends, server stays up");
                    let _ = tx
                        .send(RpcResponse::Result(RpcResult {
                            success: true,
                            ..RpcResult::default()
                        }))
                        .await;
                    break;
                }
                RpcRequest::Shutdown => {
                    info!("Shutdown requested");
                    let _ = tx.send(RpcResponse::ShutdownAck).await;
                    // Let the writer flush the ack before the process starts
                    // exiting.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let _ = stop.send(true);
                    break;
                }
                _ => unreachable!("all tracked requests carry a request_id"),
            },
            Some(request_id) => {
                dispatch_tracked(request_id, value, request, &cache, &executor, &tx).await;
            }
        }
    }

    info!("Connection from {peer} closed");
    drop(tx);
    let _ = writer.await;
}

/// Route a request with an idempotency key through the cache, spawning the
/// handler so file RPCs can interleave (exec serializes on the executor
/// lock).
async fn dispatch_tracked(
    request_id: String,
    raw: serde_json::Value,
    request: RpcRequest,
    cache: &Arc<Mutex<IdemCache>>,
    executor: &Arc<CommandExecutor>,
    tx: &mpsc::Sender<RpcResponse>,
) {
    let fingerprint = payload_fingerprint(&raw);
    let lookup = cache.lock().await.lookup(&request_id, &fingerprint);

    match lookup {
        IdemLookup::Conflict => {
            let _ = tx
                .send(RpcResponse::Error {
                    request_id: Some(request_id),
                    code: Some("request_id_conflict".into()),
                    message: "request_id reuse with different payload".into(),
                })
                .await;
        }
        IdemLookup::Done(result) => {
            info!("Returning cached result for request {request_id}");
            let _ = tx.send(RpcResponse::Result(result)).await;
        }
        IdemLookup::Join(mut rx) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let current = rx.borrow().clone();
                    if let Some(result) = current {
                        let _ = tx.send(RpcResponse::Result(result)).await;
                        return;
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            });
        }
        IdemLookup::Fresh(done_tx) => {
            let cache = Arc::clone(cache);
            let executor = Arc::clone(executor);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut result = handle_request(request, &executor).await;
                result.request_id = Some(request_id.clone());
                cache.lock().await.complete(&request_id, result.clone());
                let _ = done_tx.send(Some(result.clone()));
                let _ = tx.send(RpcResponse::Result(result)).await;
            });
        }
    }
}

async fn handle_request(request: RpcRequest, executor: &CommandExecutor) -> RpcResult {
    match request {
        RpcRequest::Exec {
            command,
            working_dir,
            timeout_secs,
            ..
        } => {
            let preview: String = command.chars().take(100).collect();
            info!("Executing: {preview}");
            let timeout = timeout_secs
                .map_or(DEFAULT_EXEC_TIMEOUT, Duration::from_secs);
            executor
                .exec(&command, working_dir.as_deref(), timeout)
                .await
        }
        RpcRequest::ReadFile { path, .. } => read_file(&path).await,
        RpcRequest::ReadBytes { path, .. } => read_bytes(&path).await,
        RpcRequest::WriteFile { path, content, .. } => write_file(&path, &content).await,
        RpcRequest::EditFile {
            path,
            old_text,
            new_text,
            ..
        } => edit_file(&path, &old_text, &new_text).await,
        RpcRequest::ListDir { path, .. } => list_dir(&path).await,
        RpcRequest::Ping | RpcRequest::Close | RpcRequest::Shutdown => {
            RpcResult::failure("control messages must not carry a request_id")
        }
    }
}

/// Refuse a second concurrent client: finish the handshake so the error is
/// readable, then close.
async fn refuse_connection(stream: TcpStream) {
    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
        let refusal = RpcResponse::Error {
            request_id: None,
            code: Some("busy".into()),
            message: "another client is connected".into(),
        };
        if let Ok(text) = serde_json::to_string(&refusal) {
            let _ = ws.send(Message::Text(text)).await;
        }
        let _ = ws.close(None).await;
    }
}

/// The launcher starts the agent with the session directory as its working
/// directory; the tmux socket lives there so force-stop can find it.
fn mux_socket_path() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"));
    let in_session_dir = cwd
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with("hostlink-"));
    if in_session_dir {
        cwd.join("tmux.sock")
    } else {
        PathBuf::from("/tmp/hostlink-tmux.sock")
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("hostlink-agent v{} starting", env!("CARGO_PKG_VERSION"));
    if !cli.token.is_empty() {
        info!("Authentication token enabled");
    }
    if cli.no_tmux {
        info!("Running without tmux (no session persistence)");
    }

    let listener = match TcpListener::bind(("127.0.0.1", cli.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind 127.0.0.1:{}: {e}", cli.port);
            std::process::exit(1);
        }
    };
    info!("Listening on ws://127.0.0.1:{}", cli.port);

    let executor = Arc::new(CommandExecutor::new(!cli.no_tmux, mux_socket_path()));
    let (stop_tx, mut stop_rx) = watch::channel(false);

    // SIGINT/SIGTERM behave like a shutdown request.
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to register SIGTERM");
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            let _ = stop_tx.send(true);
        });
    }

    // One client at a time; extra connections are refused.
    let client_slot = Arc::new(Semaphore::new(1));

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                match Arc::clone(&client_slot).try_acquire_owned() {
                    Ok(permit) => {
                        tokio::spawn(handle_connection(
                            stream,
                            cli.token.clone(),
                            Arc::clone(&executor),
                            stop_tx.clone(),
                            permit,
                        ));
                    }
                    Err(_) => {
                        warn!("Refusing concurrent connection");
                        tokio::spawn(refuse_connection(stream));
                    }
                }
            }
        }
    }

    info!("Shutting down, cleaning up executor...");
    executor.cleanup().await;
    info!("hostlink-agent stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_parse_extracts_output_and_exit_code() {
        let raw = "\
$ echo __HOSTLINK_START_abc__; ls; __hl_ec=$?; echo; echo __HOSTLINK_END_abc__$__hl_ec\n\
__HOSTLINK_START_abc__\n\
file1\n\
file2\n\
\n\
__HOSTLINK_END_abc__0\n\
$ ";
        let (output, exit_code) =
            parse_markers(raw, "__HOSTLINK_START_abc__", "__HOSTLINK_END_abc__").unwrap();
        assert_eq!(output, "file1\nfile2");
        assert_eq!(exit_code, 0);
    }

    #[test]
    fn marker_parse_reads_nonzero_exit_codes() {
        for code in [1, 2, 137] {
            let raw = format!(
                "__HOSTLINK_START_x__\nboom\n\n__HOSTLINK_END_x__{code}\n"
            );
            let (output, exit_code) =
                parse_markers(&raw, "__HOSTLINK_START_x__", "__HOSTLINK_END_x__").unwrap();
            assert_eq!(output, "boom");
            assert_eq!(exit_code, code);
        }
    }

    #[test]
    fn marker_parse_skips_echoed_command_line() {
        // Only the echoed input line is present; no real markers yet.
        let raw = "$ echo __HOSTLINK_START_y__; sleep 5; echo __HOSTLINK_END_y__$__hl_ec\n";
        assert!(parse_markers(raw, "__HOSTLINK_START_y__", "__HOSTLINK_END_y__").is_none());
    }

    #[test]
    fn marker_parse_returns_none_without_end_marker() {
        let raw = "__HOSTLINK_START_z__\npartial output\n";
        assert!(parse_markers(raw, "__HOSTLINK_START_z__", "__HOSTLINK_END_z__").is_none());
    }

    #[test]
    fn fingerprint_is_order_insensitive_and_payload_sensitive() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"type":"exec","command":"ls","request_id":"r"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"request_id":"r","type":"exec","command":"ls"}"#).unwrap();
        let c: serde_json::Value =
            serde_json::from_str(r#"{"type":"exec","command":"ls -l","request_id":"r"}"#).unwrap();
        assert_eq!(payload_fingerprint(&a), payload_fingerprint(&b));
        assert_ne!(payload_fingerprint(&a), payload_fingerprint(&c));
    }

    #[test]
    fn idem_cache_returns_cached_result_for_same_payload() {
        let mut cache = IdemCache::new();
        let tx = match cache.lookup("r1", "fp") {
            IdemLookup::Fresh(tx) => tx,
            _ => panic!("expected fresh"),
        };
        let result = RpcResult {
            request_id: Some("r1".into()),
            success: true,
            output: Some("once".into()),
            ..RpcResult::default()
        };
        cache.complete("r1", result.clone());
        drop(tx);

        match cache.lookup("r1", "fp") {
            IdemLookup::Done(cached) => assert_eq!(cached.output.as_deref(), Some("once")),
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn idem_cache_conflicts_on_fingerprint_mismatch() {
        let mut cache = IdemCache::new();
        let _tx = match cache.lookup("r1", "fp-a") {
            IdemLookup::Fresh(tx) => tx,
            _ => panic!("expected fresh"),
        };
        assert!(matches!(
            cache.lookup("r1", "fp-b"),
            IdemLookup::Conflict
        ));
    }

    #[test]
    fn idem_cache_joins_in_flight_requests() {
        let mut cache = IdemCache::new();
        let _tx = match cache.lookup("r1", "fp") {
            IdemLookup::Fresh(tx) => tx,
            _ => panic!("expected fresh"),
        };
        assert!(matches!(cache.lookup("r1", "fp"), IdemLookup::Join(_)));
    }

    #[tokio::test]
    async fn oneshot_exec_reports_true_exit_codes() {
        for code in [0, 1, 2, 137] {
            let result = exec_oneshot(&format!("exit {code}"), Duration::from_secs(5)).await;
            assert_eq!(result.exit_code, Some(code));
            assert_eq!(result.success, code == 0);
        }
    }

    #[tokio::test]
    async fn oneshot_exec_times_out_without_hanging() {
        let result = exec_oneshot("sleep 10", Duration::from_millis(100)).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.txt");
        let path = path.to_str().unwrap();

        let written = write_file(path, "A").await;
        assert!(written.success, "{:?}", written.error);
        assert_eq!(written.bytes, Some(1));

        let read = read_file(path).await;
        assert_eq!(read.content.as_deref(), Some("A"));

        // No temp droppings left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".hostlink_tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn read_bytes_round_trips_binary() {
        use base64::Engine;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin.dat");
        std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();

        let result = read_bytes(path.to_str().unwrap()).await;
        assert!(result.success);
        assert_eq!(result.size, Some(4));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(result.content_b64.unwrap())
            .unwrap();
        assert_eq!(decoded, vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn edit_file_enforces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "A").unwrap();
        let path = path.to_str().unwrap();

        let result = edit_file(path, "A", "BBB").await;
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "BBB");

        // Same old_text again: no occurrence left.
        let result = edit_file(path, "A", "C").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn list_dir_types_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), "hi").unwrap();

        let result = list_dir(dir.path().to_str().unwrap()).await;
        let entries = result.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "f.txt");
        assert_eq!(entries[0].entry_type, "file");
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].entry_type, "dir");
        assert!(entries[0].mtime.is_some());
    }

    #[test]
    fn working_dir_is_quoted_into_effective_command() {
        assert_eq!(sh_quote("/work dir"), "'/work dir'");
        let effective = format!("cd {} && {{ pwd; }}", sh_quote("/it's"));
        assert_eq!(effective, "cd '/it'\\''s' && { pwd; }");
    }
}
