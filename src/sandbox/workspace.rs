//! Per-job workspace directories and the file-level tool primitives.
//!
//! The workspace is a host directory bind-mounted into the container at
//! `/workspace`, so `read_file` / `write_file` / `list_directory` operate
//! on the host side of the mount; only `run_command` crosses into the
//! container. Paths are validated against the workspace root before any
//! I/O — the model chooses them.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::tools::truncate_to_bytes;

/// Create the workspace directory for one reservation.
///
/// The attempt number is part of the path so retries running on different
/// workers never collide on a shared filesystem.
pub fn create_workspace(base: &Path, job_id: Uuid, attempt: u32) -> Result<PathBuf, SandboxError> {
    let dir = base.join(format!("{job_id}-{attempt}"));
    std::fs::create_dir_all(&dir).map_err(|e| SandboxError::StartFailed {
        job_id,
        reason: format!("failed to create workspace {}: {e}", dir.display()),
    })?;
    dir.canonicalize().map_err(|e| SandboxError::StartFailed {
        job_id,
        reason: format!("failed to canonicalize workspace {}: {e}", dir.display()),
    })
}

/// Resolve a model-supplied relative path inside the workspace.
///
/// Rejects absolute paths and any traversal that escapes the root. The
/// target file may not exist yet (write_file), so validation walks
/// components instead of canonicalizing.
fn resolve(workspace: &Path, tool: &str, raw: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(raw);
    if rel.is_absolute() {
        return Err(SandboxError::ToolExecutionFailed {
            tool: tool.to_string(),
            reason: format!("absolute paths are not allowed: {raw}"),
        });
    }
    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(SandboxError::ToolExecutionFailed {
                        tool: tool.to_string(),
                        reason: format!("path escapes the workspace: {raw}"),
                    });
                }
            }
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    Ok(workspace.join(rel))
}

pub async fn read_file(
    workspace: &Path,
    input: &Value,
    limit_bytes: usize,
) -> Result<Value, SandboxError> {
    let raw = require_str(input, "read_file", "path")?;
    let path = resolve(workspace, "read_file", raw)?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SandboxError::ToolExecutionFailed {
            tool: "read_file".to_string(),
            reason: format!("{raw}: {e}"),
        })?;
    let (content, truncated) = truncate_to_bytes(&content, limit_bytes);
    Ok(json!({ "content": content, "truncated": truncated }))
}

pub async fn write_file(workspace: &Path, input: &Value) -> Result<Value, SandboxError> {
    let raw = require_str(input, "write_file", "path")?;
    let content = require_str(input, "write_file", "content")?;
    let path = resolve(workspace, "write_file", raw)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SandboxError::ToolExecutionFailed {
                tool: "write_file".to_string(),
                reason: format!("{raw}: {e}"),
            })?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| SandboxError::ToolExecutionFailed {
            tool: "write_file".to_string(),
            reason: format!("{raw}: {e}"),
        })?;
    Ok(json!({ "bytes_written": content.len() }))
}

pub async fn list_directory(workspace: &Path, input: &Value) -> Result<Value, SandboxError> {
    let raw = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let path = resolve(workspace, "list_directory", raw)?;
    let mut reader =
        tokio::fs::read_dir(&path)
            .await
            .map_err(|e| SandboxError::ToolExecutionFailed {
                tool: "list_directory".to_string(),
                reason: format!("{raw}: {e}"),
            })?;
    let mut entries = Vec::new();
    while let Some(entry) =
        reader
            .next_entry()
            .await
            .map_err(|e| SandboxError::ToolExecutionFailed {
                tool: "list_directory".to_string(),
                reason: format!("{raw}: {e}"),
            })?
    {
        let mut name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();
    Ok(json!({ "entries": entries }))
}

/// Whether any tool left an artifact in the workspace. Used to judge
/// partial results when the iteration cap is hit.
pub async fn has_artifacts(workspace: &Path) -> bool {
    match tokio::fs::read_dir(workspace).await {
        Ok(mut reader) => matches!(reader.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

pub(crate) fn require_str<'a>(
    input: &'a Value,
    tool: &str,
    field: &str,
) -> Result<&'a str, SandboxError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SandboxError::ToolExecutionFailed {
            tool: tool.to_string(),
            reason: format!("missing required field '{field}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();

        let out = write_file(ws, &json!({"path": "src/main.rs", "content": "fn main() {}"}))
            .await
            .unwrap();
        assert_eq!(out["bytes_written"], 12);

        let out = read_file(ws, &json!({"path": "src/main.rs"}), 5000)
            .await
            .unwrap();
        assert_eq!(out["content"], "fn main() {}");
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn read_truncates_at_the_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write_file(ws, &json!({"path": "big.txt", "content": "x".repeat(6000)}))
            .await
            .unwrap();

        let out = read_file(ws, &json!({"path": "big.txt"}), 5000).await.unwrap();
        assert_eq!(out["content"].as_str().unwrap().len(), 5000);
        assert_eq!(out["truncated"], true);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();

        let err = read_file(ws, &json!({"path": "../outside.txt"}), 5000)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ToolExecutionFailed { .. }));

        let err = write_file(ws, &json!({"path": "/etc/passwd", "content": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ToolExecutionFailed { .. }));

        // Descending then climbing back out is still an escape.
        let err = read_file(ws, &json!({"path": "a/../../outside"}), 5000)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ToolExecutionFailed { .. }));

        // Plain in-and-out stays inside and is allowed to fail on I/O only.
        let err = read_file(ws, &json!({"path": "a/../missing.txt"}), 5000)
            .await
            .unwrap_err();
        let SandboxError::ToolExecutionFailed { reason, .. } = err else {
            panic!("expected tool failure");
        };
        assert!(!reason.contains("escapes"));
    }

    #[tokio::test]
    async fn listing_marks_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write_file(ws, &json!({"path": "sub/file.txt", "content": "1"}))
            .await
            .unwrap();
        write_file(ws, &json!({"path": "top.txt", "content": "2"}))
            .await
            .unwrap();

        let out = list_directory(ws, &json!({})).await.unwrap();
        assert_eq!(out["entries"], json!(["sub/", "top.txt"]));
    }

    #[tokio::test]
    async fn artifact_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_artifacts(tmp.path()).await);
        write_file(tmp.path(), &json!({"path": "out.md", "content": "done"}))
            .await
            .unwrap();
        assert!(has_artifacts(tmp.path()).await);
    }

    #[tokio::test]
    async fn workspace_paths_are_per_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let first = create_workspace(tmp.path(), job_id, 0).unwrap();
        let second = create_workspace(tmp.path(), job_id, 1).unwrap();
        assert_ne!(first, second);
    }
}
