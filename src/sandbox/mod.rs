//! Sandbox executor: disposable, capped containers isolating every
//! side-effect an agent produces.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               SandboxExecutor                  │
//! │                                                │
//! │  launch(job, attempt, extras)                  │
//! │    ├─ workspace dir  {base}/{job_id}-{attempt} │
//! │    ├─ container      taskforge-job-{job_id}    │
//! │    │    memory ≤ 2 GiB, 1 CPU, cap_drop ALL,   │
//! │    │    no-new-privileges, tmpfs /tmp          │
//! │    └─ SandboxSession                           │
//! │         read_file / write_file / list_directory│
//! │         run_command (docker exec)              │
//! │         typed helpers (rendered to commands)   │
//! │                                                │
//! │  teardown on every exit path + startup reaper  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The [`SandboxSession`] / [`SandboxLauncher`] traits keep the agent loop
//! testable without a Docker daemon.

mod docker;
pub mod tools;
pub mod workspace;

pub use docker::SandboxExecutor;
pub use tools::{ToolSpec, TypedTool, base_tool_specs, truncate_to_bytes};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SandboxError;
use crate::job::Job;

/// One live sandbox bound to one job attempt.
#[async_trait]
pub trait SandboxSession: Send + Sync {
    /// Tools callable in this session (base primitives + profile extras).
    fn tool_specs(&self) -> Vec<ToolSpec>;

    /// Execute a tool by name. Unknown names fail closed.
    async fn execute(&self, name: &str, input: &Value) -> Result<Value, SandboxError>;

    /// Whether any tool left an artifact in the workspace.
    async fn has_artifacts(&self) -> bool;

    /// Tear the sandbox down. Idempotent; called on every exit path.
    async fn close(&self);
}

/// Factory for sandbox sessions.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(
        &self,
        job: &Job,
        attempt: u32,
        extras: &[TypedTool],
    ) -> Result<Box<dyn SandboxSession>, SandboxError>;
}
