//! Cross-backend file and directory comparison.
//!
//! Both sides go through the backend capability set, so any pairing of
//! local and remote works the same way (local↔local is rejected by the CLI
//! — there are better tools for that on one machine). Contents travel as
//! base64 via `read_bytes`, so binary files compare correctly.

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::backend::ExecutionBackend;
use crate::error::HostError;
use crate::protocol::DirEntry;

/// Above this many lines the text diff degrades to a checksum summary.
const MAX_DIFF_LINES: usize = 2000;

/// One side of a comparison: backend, display label, and path.
pub struct CompareSide<'a> {
    pub backend: &'a dyn ExecutionBackend,
    pub label: &'a str,
    pub path: &'a str,
}

/// Compare two files and render a human-readable report.
pub async fn compare_file(
    left: CompareSide<'_>,
    right: CompareSide<'_>,
) -> Result<String, HostError> {
    let left_bytes = match fetch_bytes(&left).await? {
        Ok(bytes) => bytes,
        Err(msg) => return Ok(msg),
    };
    let right_bytes = match fetch_bytes(&right).await? {
        Ok(bytes) => bytes,
        Err(msg) => return Ok(msg),
    };

    let left_sum = sha256_hex(&left_bytes);
    let right_sum = sha256_hex(&right_bytes);
    let left_text = std::str::from_utf8(&left_bytes).ok();
    let right_text = std::str::from_utf8(&right_bytes).ok();

    if left_sum == right_sum {
        let kind = if left_text.is_some() { "Text" } else { "Binary" };
        return Ok(format!("{kind} files are identical (sha256:{left_sum})"));
    }

    match (left_text, right_text) {
        (Some(a), Some(b)) => {
            let header = format!(
                "Text files differ:\n--- {}:{}\n+++ {}:{}",
                left.label, left.path, right.label, right.path
            );
            if a.lines().count() > MAX_DIFF_LINES || b.lines().count() > MAX_DIFF_LINES {
                Ok(format!(
                    "{header}\n(files too large to diff; sha256 {left_sum} vs {right_sum})"
                ))
            } else {
                Ok(format!("{header}\n{}", diff_lines(a, b)))
            }
        }
        _ => Ok(format!(
            "Binary files differ:\n  {}:{} sha256:{left_sum} ({} bytes)\n  {}:{} sha256:{right_sum} ({} bytes)",
            left.label,
            left.path,
            left_bytes.len(),
            right.label,
            right.path,
            right_bytes.len()
        )),
    }
}

/// Compare two directory listings (non-recursive).
pub async fn compare_dir(
    left: CompareSide<'_>,
    right: CompareSide<'_>,
) -> Result<String, HostError> {
    let left_entries = match fetch_entries(&left).await? {
        Ok(entries) => entries,
        Err(msg) => return Ok(msg),
    };
    let right_entries = match fetch_entries(&right).await? {
        Ok(entries) => entries,
        Err(msg) => return Ok(msg),
    };

    let mut lines = Vec::new();
    let right_by_name: std::collections::BTreeMap<&str, &DirEntry> =
        right_entries.iter().map(|e| (e.name.as_str(), e)).collect();
    let left_names: std::collections::BTreeSet<&str> =
        left_entries.iter().map(|e| e.name.as_str()).collect();

    for entry in &left_entries {
        match right_by_name.get(entry.name.as_str()) {
            None => lines.push(format!("only in {}: {}", left.label, entry.name)),
            Some(other) if other.entry_type != entry.entry_type => lines.push(format!(
                "type differs for {}: {} vs {}",
                entry.name, entry.entry_type, other.entry_type
            )),
            Some(other) if entry.entry_type == "file" && other.size != entry.size => {
                lines.push(format!(
                    "size differs for {}: {} vs {} bytes",
                    entry.name, entry.size, other.size
                ));
            }
            Some(_) => {}
        }
    }
    for entry in &right_entries {
        if !left_names.contains(entry.name.as_str()) {
            lines.push(format!("only in {}: {}", right.label, entry.name));
        }
    }

    if lines.is_empty() {
        Ok(format!(
            "Directories match: {} entries on each side",
            left_entries.len()
        ))
    } else {
        Ok(format!(
            "Directories differ ({} findings):\n{}",
            lines.len(),
            lines.join("\n")
        ))
    }
}

async fn fetch_bytes(side: &CompareSide<'_>) -> Result<Result<Vec<u8>, String>, HostError> {
    let result = side.backend.read_bytes(side.path).await?;
    if !result.success {
        return Ok(Err(format!(
            "Cannot read {}:{}: {}",
            side.label,
            side.path,
            result.error.unwrap_or_else(|| "unknown error".into())
        )));
    }
    let encoded = result.content_b64.unwrap_or_default();
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => Ok(Ok(bytes)),
        Err(e) => Ok(Err(format!(
            "Invalid base64 payload from {}:{}: {e}",
            side.label, side.path
        ))),
    }
}

async fn fetch_entries(
    side: &CompareSide<'_>,
) -> Result<Result<Vec<DirEntry>, String>, HostError> {
    let result = side.backend.list_dir(side.path).await?;
    if !result.success {
        return Ok(Err(format!(
            "Cannot list {}:{}: {}",
            side.label,
            side.path,
            result.error.unwrap_or_else(|| "unknown error".into())
        )));
    }
    Ok(Ok(result.entries.unwrap_or_default()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Minimal line-level diff: LCS over lines, rendered as `-`/`+` hunks with
/// one-based line numbers. The corpus carries no diff crate, and this output
/// only feeds human eyes.
fn diff_lines(a: &str, b: &str) -> String {
    let a_lines: Vec<&str> = a.lines().collect();
    let b_lines: Vec<&str> = b.lines().collect();

    // LCS lengths table.
    let mut table = vec![vec![0usize; b_lines.len() + 1]; a_lines.len() + 1];
    for i in (0..a_lines.len()).rev() {
        for j in (0..b_lines.len()).rev() {
            table[i][j] = if a_lines[i] == b_lines[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    let mut hunk: Vec<String> = Vec::new();
    let mut hunk_start = (0, 0);

    let flush = |hunk: &mut Vec<String>, start: (usize, usize), out: &mut Vec<String>| {
        if !hunk.is_empty() {
            out.push(format!("@@ -{} +{} @@", start.0 + 1, start.1 + 1));
            out.append(hunk);
        }
    };

    while i < a_lines.len() || j < b_lines.len() {
        if i < a_lines.len() && j < b_lines.len() && a_lines[i] == b_lines[j] {
            flush(&mut hunk, hunk_start, &mut out);
            i += 1;
            j += 1;
            hunk_start = (i, j);
        } else if j < b_lines.len() && (i == a_lines.len() || table[i][j + 1] >= table[i + 1][j]) {
            hunk.push(format!("+{}", b_lines[j]));
            j += 1;
        } else {
            hunk.push(format!("-{}", a_lines[i]));
            i += 1;
        }
    }
    flush(&mut hunk, hunk_start, &mut out);
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    fn side<'a>(backend: &'a LocalBackend, label: &'a str, path: &'a str) -> CompareSide<'a> {
        CompareSide {
            backend,
            label,
            path,
        }
    }

    #[tokio::test]
    async fn identical_text_files_report_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "same\n").unwrap();
        std::fs::write(&b, "same\n").unwrap();
        let backend = LocalBackend::new(None);

        let report = compare_file(
            side(&backend, "left", a.to_str().unwrap()),
            side(&backend, "right", b.to_str().unwrap()),
        )
        .await
        .unwrap();
        assert!(report.starts_with("Text files are identical"));
        assert!(report.contains("sha256:"));
    }

    #[tokio::test]
    async fn differing_text_files_show_line_diff() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "hello\nworld\n").unwrap();
        std::fs::write(&b, "hello\nWORLD\n").unwrap();
        let backend = LocalBackend::new(None);

        let report = compare_file(
            side(&backend, "a", a.to_str().unwrap()),
            side(&backend, "b", b.to_str().unwrap()),
        )
        .await
        .unwrap();
        assert!(report.starts_with("Text files differ:"));
        assert!(report.contains("--- a:"));
        assert!(report.contains("-world"));
        assert!(report.contains("+WORLD"));
    }

    #[tokio::test]
    async fn binary_files_compare_by_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, [0u8, 1, 2, 255]).unwrap();
        std::fs::write(&b, [0u8, 1, 2, 255]).unwrap();
        let backend = LocalBackend::new(None);

        let report = compare_file(
            side(&backend, "l", a.to_str().unwrap()),
            side(&backend, "r", b.to_str().unwrap()),
        )
        .await
        .unwrap();
        assert!(report.starts_with("Binary files are identical"));
    }

    #[tokio::test]
    async fn missing_file_reports_readable_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "x").unwrap();
        let backend = LocalBackend::new(None);

        let report = compare_file(
            side(&backend, "l", a.to_str().unwrap()),
            side(&backend, "r", "/does/not/exist"),
        )
        .await
        .unwrap();
        assert!(report.contains("Cannot read r:/does/not/exist"));
    }

    #[tokio::test]
    async fn dir_compare_finds_missing_and_size_changes() {
        let left = tempfile::tempdir().unwrap();
        let right = tempfile::tempdir().unwrap();
        std::fs::write(left.path().join("both.txt"), "aa").unwrap();
        std::fs::write(right.path().join("both.txt"), "a").unwrap();
        std::fs::write(left.path().join("only_left.txt"), "x").unwrap();
        std::fs::write(right.path().join("only_right.txt"), "y").unwrap();
        let backend = LocalBackend::new(None);

        let report = compare_dir(
            side(&backend, "l", left.path().to_str().unwrap()),
            side(&backend, "r", right.path().to_str().unwrap()),
        )
        .await
        .unwrap();
        assert!(report.contains("only in l: only_left.txt"));
        assert!(report.contains("only in r: only_right.txt"));
        assert!(report.contains("size differs for both.txt: 2 vs 1 bytes"));
    }

    #[test]
    fn diff_marks_insertions_and_deletions() {
        let diff = diff_lines("a\nb\nc", "a\nc\nd");
        assert!(diff.contains("-b"));
        assert!(diff.contains("+d"));
        assert!(!diff.contains("-a"));
    }
}
