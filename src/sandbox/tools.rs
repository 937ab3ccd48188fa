//! Tool definitions shared by the sandbox and the provider gateway.
//!
//! Every agent gets the four base primitives; profiles may add typed
//! helpers, which render to shell commands executed through the same
//! `run_command` path.

use serde_json::{Value, json};

/// A tool visible to the model: name, human description, JSON input schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A profile-registered helper tool.
///
/// `render` turns the model-supplied input into the shell command the
/// sandbox runs on the helper's behalf.
#[derive(Debug, Clone)]
pub struct TypedTool {
    pub spec: ToolSpec,
    pub render: fn(&Value) -> String,
}

/// The four primitives every agent can call.
pub fn base_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the contents of a file in the workspace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the workspace root"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write or overwrite a file in the workspace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the workspace root"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full content to write"
                    }
                },
                "required": ["path", "content"]
            }),
        },
        ToolSpec {
            name: "list_directory".to_string(),
            description: "List files and directories in the workspace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to list (default: workspace root)"
                    }
                }
            }),
        },
        ToolSpec {
            name: "run_command".to_string(),
            description: "Execute a bash command in the sandbox".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cmd": {
                        "type": "string",
                        "description": "Bash command to execute"
                    },
                    "timeout_s": {
                        "type": "integer",
                        "description": "Optional per-command timeout in seconds"
                    }
                },
                "required": ["cmd"]
            }),
        },
    ]
}

/// Helper for testing agents: run the project's test suite.
pub fn run_tests_tool() -> TypedTool {
    TypedTool {
        spec: ToolSpec {
            name: "run_tests".to_string(),
            description: "Run the project's test suite and report the results".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Override the auto-detected test command"
                    }
                }
            }),
        },
        render: |input| {
            input
                .get("command")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    "if [ -f package.json ]; then npm test; \
                     elif [ -f Cargo.toml ]; then cargo test; \
                     elif [ -f pyproject.toml ] || [ -f setup.py ]; then python -m pytest; \
                     else echo 'no recognized test runner' >&2; exit 1; fi"
                        .to_string()
                })
        },
    }
}

/// Helper for deployment agents: build the project's Docker image.
pub fn build_docker_image_tool() -> TypedTool {
    TypedTool {
        spec: ToolSpec {
            name: "build_docker_image".to_string(),
            description: "Build a Docker image from the workspace Dockerfile".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tag": {
                        "type": "string",
                        "description": "Image tag (default: workspace)"
                    }
                },
                "required": []
            }),
        },
        render: |input| {
            let tag = input
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or("workspace");
            // Shell-quote the tag; it comes from the model.
            format!("docker build -t '{}' .", tag.replace('\'', ""))
        },
    }
}

/// Helper for monitoring agents: probe an HTTP endpoint.
pub fn http_probe_tool() -> TypedTool {
    TypedTool {
        spec: ToolSpec {
            name: "http_probe".to_string(),
            description: "Probe an HTTP endpoint and report status code and latency".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to probe"
                    }
                },
                "required": ["url"]
            }),
        },
        render: |input| {
            let url = input.get("url").and_then(|v| v.as_str()).unwrap_or("");
            format!(
                "curl -s -o /dev/null -w 'status=%{{http_code}} time_total=%{{time_total}}s\\n' '{}'",
                url.replace('\'', "")
            )
        },
    }
}

/// Truncate `s` to at most `limit` bytes, cutting back to the nearest
/// char boundary. Returns the (possibly shortened) text and whether
/// truncation happened — output at exactly the ceiling is not truncated.
pub fn truncate_to_bytes(s: &str, limit: usize) -> (String, bool) {
    if s.len() <= limit {
        return (s.to_string(), false);
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_specs_cover_the_contract() {
        let specs = base_tool_specs();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["read_file", "write_file", "list_directory", "run_command"]
        );
        for spec in &specs {
            assert_eq!(spec.input_schema["type"], "object");
        }
    }

    #[test]
    fn truncation_boundary_is_exact() {
        // Exactly at the ceiling: untouched, not flagged.
        let s = "a".repeat(5000);
        let (out, truncated) = truncate_to_bytes(&s, 5000);
        assert_eq!(out.len(), 5000);
        assert!(!truncated);

        // One byte over: cut and flagged.
        let s = "a".repeat(5001);
        let (out, truncated) = truncate_to_bytes(&s, 5000);
        assert_eq!(out.len(), 5000);
        assert!(truncated);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a limit landing mid-char must back off.
        let s = "ééé"; // 6 bytes
        let (out, truncated) = truncate_to_bytes(s, 3);
        assert_eq!(out, "é");
        assert_eq!(out.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn run_tests_render_prefers_override() {
        let tool = run_tests_tool();
        let cmd = (tool.render)(&serde_json::json!({"command": "make check"}));
        assert_eq!(cmd, "make check");
        let auto = (tool.render)(&serde_json::json!({}));
        assert!(auto.contains("cargo test"));
    }

    #[test]
    fn probe_render_strips_quotes() {
        let tool = http_probe_tool();
        let cmd = (tool.render)(&serde_json::json!({"url": "https://x.example/'; rm -rf /"}));
        assert!(!cmd.contains("''"));
        assert!(cmd.starts_with("curl"));
    }
}
