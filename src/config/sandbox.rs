use std::path::PathBuf;

use crate::config::helpers::{parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Docker sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image launched for each job.
    pub image: String,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU limit in core-equivalents (1 = one full core).
    pub cpu_cores: f64,
    /// Wall-clock limit for one job run, in seconds.
    pub job_timeout_secs: u64,
    /// Per-command timeout for `run_command`, in seconds.
    pub command_timeout_secs: u64,
    /// Tool outputs are truncated to this many bytes.
    pub tool_output_limit_bytes: usize,
    /// Host directory under which per-job workspaces are created.
    pub workspace_base: PathBuf,
    /// Mount the container root filesystem read-only, leaving only the
    /// workspace volume and a tmpfs `/tmp` writable.
    pub read_only_root: bool,
}

fn default_workspace_base() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".taskforge")
        .join("workspaces")
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "taskforge-sandbox:latest".to_string(),
            memory_limit_mb: 2048,
            cpu_cores: 1.0,
            job_timeout_secs: 1800,
            command_timeout_secs: 300,
            tool_output_limit_bytes: 5000,
            workspace_base: default_workspace_base(),
            read_only_root: false,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            image: parse_string_env("SANDBOX_IMAGE", defaults.image)?,
            memory_limit_mb: parse_optional_env("SANDBOX_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_cores: parse_optional_env("SANDBOX_CPU_CORES", defaults.cpu_cores)?,
            job_timeout_secs: parse_optional_env("SANDBOX_JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
            command_timeout_secs: parse_optional_env(
                "SANDBOX_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout_secs,
            )?,
            tool_output_limit_bytes: parse_optional_env(
                "SANDBOX_TOOL_OUTPUT_LIMIT_BYTES",
                defaults.tool_output_limit_bytes,
            )?,
            workspace_base: parse_string_env(
                "SANDBOX_WORKSPACE_BASE",
                defaults.workspace_base.to_string_lossy(),
            )?
            .into(),
            read_only_root: parse_bool_env("SANDBOX_READ_ONLY_ROOT", defaults.read_only_root)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit_mb, 2048);
        assert_eq!(config.job_timeout_secs, 1800);
        assert_eq!(config.tool_output_limit_bytes, 5000);
    }
}
