//! Docker-backed sandbox executor.
//!
//! Containers are named `taskforge-job-{job_id}` so a crashed process can
//! find and remove its orphans on the next start. The workspace directory
//! is bind-mounted at `/workspace`; file primitives run against the host
//! side of the mount while `run_command` execs inside the container.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::job::Job;
use crate::sandbox::tools::{ToolSpec, TypedTool, base_tool_specs, truncate_to_bytes};
use crate::sandbox::{SandboxLauncher, SandboxSession, workspace};

/// Prefix shared by every container this executor creates.
const CONTAINER_PREFIX: &str = "taskforge-job-";

/// Launches and reaps job containers.
pub struct SandboxExecutor {
    config: SandboxConfig,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<bollard::Docker>>>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<bollard::Docker, SandboxError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Engine(e.to_string()))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// Remove orphan containers left behind by a previous process.
    ///
    /// Called once at startup; matches on the deterministic name prefix.
    pub async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        let docker = self.docker().await?;

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_PREFIX.to_string()]);
        let containers = docker
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::Engine(e.to_string()))?;

        let mut reaped = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match docker
                .remove_container(
                    &id,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    reaped += 1;
                    tracing::info!(container = %id, "reaped orphan sandbox container");
                }
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "failed to reap orphan container");
                }
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl SandboxLauncher for SandboxExecutor {
    async fn launch(
        &self,
        job: &Job,
        attempt: u32,
        extras: &[TypedTool],
    ) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let docker = self.docker().await.map_err(|e| SandboxError::StartFailed {
            job_id: job.id,
            reason: e.to_string(),
        })?;

        let workspace_dir =
            workspace::create_workspace(&self.config.workspace_base, job.id, attempt)?;

        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/workspace:rw", workspace_dir.display())]),
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            nano_cpus: Some((self.config.cpu_cores * 1e9) as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["CHOWN".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(self.config.read_only_root),
            tmpfs: Some(
                [("/tmp".to_string(), "size=512M".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            // Keep the container alive; work arrives via exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            working_dir: Some("/workspace".to_string()),
            ..Default::default()
        };

        let container_name = format!("{CONTAINER_PREFIX}{}", job.id);
        let options = CreateContainerOptions {
            name: container_name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::StartFailed {
                job_id: job.id,
                reason: e.to_string(),
            })?;
        let container_id = response.id;

        if let Err(e) = docker.start_container::<String>(&container_id, None).await {
            // Creation succeeded but start failed: clean up before bailing.
            let _ = docker
                .remove_container(
                    &container_id,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(SandboxError::StartFailed {
                job_id: job.id,
                reason: format!("failed to start container: {e}"),
            });
        }

        tracing::info!(job_id = %job.id, container = %container_name, "sandbox started");

        Ok(Box::new(DockerSession {
            docker,
            container_id,
            job_id: job.id,
            workspace: workspace_dir,
            limit_bytes: self.config.tool_output_limit_bytes,
            command_timeout: Duration::from_secs(self.config.command_timeout_secs),
            extras: extras
                .iter()
                .map(|t| (t.spec.name.clone(), t.clone()))
                .collect(),
        }))
    }
}

/// A live container bound to one job attempt.
struct DockerSession {
    docker: bollard::Docker,
    container_id: String,
    job_id: Uuid,
    workspace: PathBuf,
    limit_bytes: usize,
    command_timeout: Duration,
    extras: HashMap<String, TypedTool>,
}

impl DockerSession {
    async fn exec_command(&self, cmd: &str, timeout: Duration) -> Result<Value, SandboxError> {
        use bollard::container::LogOutput;
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-lc".to_string(), cmd.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some("/workspace".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::ToolExecutionFailed {
                tool: "run_command".to_string(),
                reason: format!("exec create failed: {e}"),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let collect = async {
            let started = self.docker.start_exec(&exec.id, None).await.map_err(|e| {
                SandboxError::ToolExecutionFailed {
                    tool: "run_command".to_string(),
                    reason: format!("exec start failed: {e}"),
                }
            })?;
            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SandboxError::ToolExecutionFailed {
                                tool: "run_command".to_string(),
                                reason: format!("exec stream error: {e}"),
                            });
                        }
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SandboxError::ToolExecutionFailed {
                    tool: "run_command".to_string(),
                    reason: format!("command timed out after {}s", timeout.as_secs()),
                });
            }
        }

        let exit_status = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|i| i.exit_code)
            .unwrap_or(-1);

        let (stdout, stdout_truncated) =
            truncate_to_bytes(&String::from_utf8_lossy(&stdout), self.limit_bytes);
        let (stderr, stderr_truncated) =
            truncate_to_bytes(&String::from_utf8_lossy(&stderr), self.limit_bytes);

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_status": exit_status,
            "truncated": stdout_truncated || stderr_truncated,
        }))
    }
}

#[async_trait]
impl SandboxSession for DockerSession {
    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = base_tool_specs();
        specs.extend(self.extras.values().map(|t| t.spec.clone()));
        specs
    }

    async fn execute(&self, name: &str, input: &Value) -> Result<Value, SandboxError> {
        match name {
            "read_file" => workspace::read_file(&self.workspace, input, self.limit_bytes).await,
            "write_file" => workspace::write_file(&self.workspace, input).await,
            "list_directory" => workspace::list_directory(&self.workspace, input).await,
            "run_command" => {
                let cmd = workspace::require_str(input, "run_command", "cmd")?;
                let timeout = input
                    .get("timeout_s")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs)
                    .unwrap_or(self.command_timeout);
                self.exec_command(cmd, timeout).await
            }
            other => match self.extras.get(other) {
                Some(tool) => {
                    let cmd = (tool.render)(input);
                    self.exec_command(&cmd, self.command_timeout).await
                }
                None => Err(SandboxError::ToolExecutionFailed {
                    tool: other.to_string(),
                    reason: "unknown tool".to_string(),
                }),
            },
        }
    }

    async fn has_artifacts(&self) -> bool {
        workspace::has_artifacts(&self.workspace).await
    }

    async fn close(&self) {
        if let Err(e) = self
            .docker
            .stop_container(
                &self.container_id,
                Some(bollard::container::StopContainerOptions { t: 5 }),
            )
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to stop sandbox container (may already be stopped)");
        }
        if let Err(e) = self
            .docker
            .remove_container(
                &self.container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to remove sandbox container (reaper will retry at next start)");
        }
        tracing::info!(job_id = %self.job_id, "sandbox torn down");
    }
}
