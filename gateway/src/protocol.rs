//! Wire protocol shared with the on-host agent.
//!
//! Frames are JSON objects, one per WebSocket text message, with a `type`
//! discriminator and snake_case fields. The agent crate carries its own copy
//! of these shapes — it is compiled standalone on the remote host and cannot
//! take a path dependency on this crate — so changes here must be mirrored
//! in `agent/remote_server.rs`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// First frame sent by the client after the WebSocket opens.
///
/// `token` is the empty string when no auth token is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    pub token: String,
}

/// Client → server request frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
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
    /// The idempotency key carried by this request, if any. `ping`, `close`,
    /// and `shutdown` are untracked.
    pub fn request_id(&self) -> Option<&str> {
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

/// Server → client response frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
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

/// Structured result payload for `result` frames.
///
/// Only the fields relevant to the request type are populated; everything
/// else stays `None` and is omitted from the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RpcResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    /// Captured command output (`exec`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// UTF-8 file content (`read_file`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Base64-encoded file content (`read_bytes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
    /// File size in bytes (`read_bytes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Directory entries (`list_dir`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<DirEntry>>,
    /// Bytes written (`write_file`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Path acted upon (`write_file`, `edit_file`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Application-level error, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RpcResult {
    /// A failed result carrying only an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        RpcResult {
            success: false,
            error: Some(error.into()),
            ..RpcResult::default()
        }
    }
}

/// A single entry in a `list_dir` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    /// One of `"file"`, `"dir"`, `"symlink"`, or `"other"`.
    #[serde(rename = "type")]
    pub entry_type: String,
    pub size: u64,
    /// Last-modified time, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// The agent hashes this form to detect `request_id` reuse with a different
/// payload, so both sides must agree on it byte-for-byte.
pub fn canonical_json(value: &serde_json::Value) -> String {
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

/// Hex sha256 of the canonical JSON form of a payload.
pub fn payload_fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_with_type_tag() {
        let req = RpcRequest::Exec {
            request_id: "r-1".into(),
            command: "printf hello".into(),
            working_dir: Some("/tmp".into()),
            timeout_secs: None,
        };
        let text = serde_json::to_string(&req).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "exec");
        assert_eq!(value["working_dir"], "/tmp");
        assert!(value.get("timeout_secs").is_none());

        let back: RpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn result_omits_unused_fields() {
        let resp = RpcResponse::Result(RpcResult {
            request_id: Some("r-2".into()),
            success: true,
            output: Some("ok\n".into()),
            exit_code: Some(0),
            ..RpcResult::default()
        });
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["exit_code"], 0);
        assert!(value.get("entries").is_none());
        assert!(value.get("content").is_none());
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = json!({"type": "exec", "command": "ls", "request_id": "x"});
        let b = json!({"request_id": "x", "command": "ls", "type": "exec"});
        assert_eq!(payload_fingerprint(&a), payload_fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_on_payload_change() {
        let a = json!({"type": "exec", "command": "ls", "request_id": "x"});
        let b = json!({"type": "exec", "command": "ls -la", "request_id": "x"});
        assert_ne!(payload_fingerprint(&a), payload_fingerprint(&b));
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let v = json!({"b": {"z": 1, "a": [2, {"y": 3, "x": 4}]}, "a": true});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":true,"b":{"a":[2,{"x":4,"y":3}],"z":1}}"#
        );
    }
}
