//! The agent loop: call the provider, execute tool calls in the sandbox,
//! append results, repeat until end-of-turn or the iteration cap.
//!
//! Per-job logic is strictly linear; fan-out happens at the worker level,
//! never inside a job. Tool-level failures become tool-result messages so
//! the model can react; only provider and sandbox infrastructure failures
//! abort the attempt.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::agent::AgentProfile;
use crate::error::JobError;
use crate::gateway::{
    ChatMessage, ContentBlock, FinishReason, ProviderGateway, ProviderRequest, Usage,
};
use crate::job::{Job, JobStatus, JobStore};
use crate::sandbox::SandboxSession;

/// Knobs for one agent run.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_iterations: u32,
    pub max_tokens: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_tokens: 4096,
        }
    }
}

/// Qualifier attached to an otherwise-successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionNote {
    /// The model hit the token limit but produced usable output.
    TruncatedOutput,
    /// The iteration cap was reached with artifacts in the workspace.
    MaxIterationsReached,
}

/// Successful (possibly qualified) agent output.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub output: Value,
    pub note: Option<CompletionNote>,
}

/// Everything one attempt produced.
///
/// Usage and transcript are populated even when the attempt failed:
/// partial tokens were spent and must reach the job row either way.
#[derive(Debug)]
pub struct AgentRun {
    pub result: Result<AgentResult, JobError>,
    pub usage: Usage,
    pub iterations: u32,
    pub transcript: String,
}

/// Check the admin-cancellation sentinel on the job row.
async fn cancelled(store: &dyn JobStore, job_id: Uuid) -> bool {
    store
        .job(job_id)
        .await
        .map(|j| j.status == JobStatus::CancelRequested)
        .unwrap_or(false)
}

/// Run the agent loop for one job attempt.
pub async fn run(
    job: &Job,
    profile: &AgentProfile,
    provider: &str,
    model: &str,
    gateway: &ProviderGateway,
    session: &dyn SandboxSession,
    store: &dyn JobStore,
    config: &AgentLoopConfig,
) -> AgentRun {
    let mut usage = Usage::default();
    let mut transcript = String::new();
    let mut iterations = 0;

    let mut messages = vec![ChatMessage::user(initial_task_text(job))];
    let system = profile.full_system_prompt();
    let tools = session.tool_specs();
    let mut last_text: Option<String> = None;

    let finish = loop {
        if iterations >= config.max_iterations {
            break if session.has_artifacts().await {
                transcript.push_str("iteration cap reached with workspace artifacts\n");
                Ok(AgentResult {
                    output: json!({
                        "summary": last_text.clone().unwrap_or_default(),
                        "partial": true,
                    }),
                    note: Some(CompletionNote::MaxIterationsReached),
                })
            } else {
                Err(JobError::MaxIterationsReached {
                    iterations: config.max_iterations,
                })
            };
        }
        iterations += 1;

        if cancelled(store, job.id).await {
            break Err(JobError::Cancelled);
        }

        let request = ProviderRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens: config.max_tokens,
        };

        let response = match gateway.invoke(provider, model, &request).await {
            Ok(response) => response,
            Err(err) => break Err(err.into()),
        };

        // Record usage on every call, including ones the job later fails on.
        usage.input += response.usage.input;
        usage.output += response.usage.output;
        transcript.push_str(&format!(
            "call {iterations}: in={} out={} finish={:?}\n",
            response.usage.input, response.usage.output, response.finish_reason
        ));

        let tool_calls: Vec<(String, String, Value)> = response
            .tool_calls()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();
        if let Some(text) = response.text() {
            last_text = Some(text);
        }
        messages.push(ChatMessage::assistant(response.blocks.clone()));

        match response.finish_reason {
            FinishReason::EndOfTurn => {
                break Ok(AgentResult {
                    output: json!({"summary": last_text.clone().unwrap_or_default()}),
                    note: None,
                });
            }
            FinishReason::Length => {
                break match &last_text {
                    Some(text) => Ok(AgentResult {
                        output: json!({"summary": text}),
                        note: Some(CompletionNote::TruncatedOutput),
                    }),
                    None => Err(JobError::Unknown {
                        reason: "model hit the length limit with no usable output".to_string(),
                    }),
                };
            }
            FinishReason::Error => {
                break Err(JobError::Unknown {
                    reason: "provider signalled an error finish".to_string(),
                });
            }
            FinishReason::ToolUse => {
                if tool_calls.is_empty() {
                    // A tool-use finish with no calls cannot make progress.
                    break match last_text {
                        Some(text) => Ok(AgentResult {
                            output: json!({"summary": text}),
                            note: None,
                        }),
                        None => Err(JobError::Unknown {
                            reason: "tool_use finish carried no tool calls".to_string(),
                        }),
                    };
                }

                let mut results = Vec::with_capacity(tool_calls.len());
                let mut aborted = None;
                for (id, name, input) in tool_calls {
                    let content = match session.execute(&name, &input).await {
                        Ok(value) => {
                            transcript.push_str(&format!("tool {name}: ok\n"));
                            value.to_string()
                        }
                        Err(err) => {
                            // Surfaced to the model, not raised: it can
                            // correct its input and try again.
                            transcript.push_str(&format!("tool {name}: error: {err}\n"));
                            json!({"error": err.to_string()}).to_string()
                        }
                    };
                    results.push((id, content));

                    if cancelled(store, job.id).await {
                        aborted = Some(JobError::Cancelled);
                        break;
                    }
                }
                if let Some(err) = aborted {
                    break Err(err);
                }
                messages.push(ChatMessage::tool_results(results));
            }
        }
    };

    AgentRun {
        result: finish,
        usage,
        iterations,
        transcript,
    }
}

/// Initial user message: the task plus any structured context the payload
/// carries alongside it.
fn initial_task_text(job: &Job) -> String {
    let task = job.task_description();
    let mut context = Vec::new();
    if let Some(obj) = job.payload.as_object() {
        for (key, value) in obj {
            if key == "task" {
                continue;
            }
            context.push(format!("{key}: {value}"));
        }
    }
    if context.is_empty() {
        task
    } else {
        format!("{task}\n\nContext:\n{}", context.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::profile_for;
    use crate::breaker::CircuitBreakerRegistry;
    use crate::config::BreakerConfig;
    use crate::error::{ProviderError, SandboxError};
    use crate::gateway::{ProviderAdapter, ProviderResponse};
    use crate::job::{JobSubmission, JobType, MemoryStore};
    use crate::sandbox::{ToolSpec, base_tool_specs};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Adapter that replays a scripted sequence of responses.
    struct ScriptedAdapter {
        script: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            _model: &str,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ProviderError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason: "script exhausted".to_string(),
                });
            }
            script.remove(0)
        }
    }

    /// In-memory sandbox; records executed tool names.
    #[derive(Default)]
    struct StubSession {
        executed: Mutex<Vec<String>>,
        artifacts: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SandboxSession for StubSession {
        fn tool_specs(&self) -> Vec<ToolSpec> {
            base_tool_specs()
        }

        async fn execute(&self, name: &str, _input: &Value) -> Result<Value, SandboxError> {
            self.executed.lock().unwrap().push(name.to_string());
            match name {
                "write_file" => {
                    self.artifacts
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(json!({"bytes_written": 10}))
                }
                "read_file" => Ok(json!({"content": "data", "truncated": false})),
                "explode" => Err(SandboxError::ToolExecutionFailed {
                    tool: "explode".into(),
                    reason: "unknown tool".into(),
                }),
                _ => Ok(json!({"stdout": "", "stderr": "", "exit_status": 0})),
            }
        }

        async fn has_artifacts(&self) -> bool {
            self.artifacts.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn close(&self) {}
    }

    fn text_response(text: &str, finish: FinishReason) -> ProviderResponse {
        ProviderResponse {
            blocks: vec![ContentBlock::Text { text: text.into() }],
            finish_reason: finish,
            usage: Usage {
                input: 100,
                output: 50,
            },
        }
    }

    fn tool_response(name: &str, id: &str) -> ProviderResponse {
        ProviderResponse {
            blocks: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input: json!({"path": "x"}),
            }],
            finish_reason: FinishReason::ToolUse,
            usage: Usage {
                input: 200,
                output: 20,
            },
        }
    }

    fn gateway_with(script: Vec<Result<ProviderResponse, ProviderError>>) -> ProviderGateway {
        let breaker = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let mut gateway = ProviderGateway::new(breaker);
        gateway.register(Arc::new(ScriptedAdapter::new(script)));
        gateway
    }

    async fn seeded_job(store: &MemoryStore) -> Job {
        let job = Job::from_submission(
            JobSubmission {
                project_id: Uuid::new_v4(),
                job_type: JobType::Implement,
                payload: json!({"task": "add feature", "repo_url": "https://example.com/r.git"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            3,
        );
        store.insert_job(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn tool_round_then_end_of_turn() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        let gateway = gateway_with(vec![
            Ok(tool_response("read_file", "tu_1")),
            Ok(text_response("done", FinishReason::EndOfTurn)),
        ]);
        let session = StubSession::default();

        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &AgentLoopConfig::default(),
        )
        .await;

        let result = run.result.unwrap();
        assert_eq!(result.output["summary"], "done");
        assert!(result.note.is_none());
        assert_eq!(run.iterations, 2);
        // Usage sums over all provider calls.
        assert_eq!(run.usage, Usage { input: 300, output: 70 });
        assert_eq!(*session.executed.lock().unwrap(), ["read_file"]);
        assert!(run.transcript.contains("call 1"));
        assert!(run.transcript.contains("call 2"));
    }

    #[tokio::test]
    async fn tool_failure_becomes_a_tool_result_not_a_job_failure() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        let gateway = gateway_with(vec![
            Ok(tool_response("explode", "tu_1")),
            Ok(text_response("recovered", FinishReason::EndOfTurn)),
        ]);
        let session = StubSession::default();

        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &AgentLoopConfig::default(),
        )
        .await;

        assert_eq!(run.result.unwrap().output["summary"], "recovered");
        assert!(run.transcript.contains("tool explode: error"));
    }

    #[tokio::test]
    async fn provider_failure_aborts_but_keeps_usage() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        let gateway = gateway_with(vec![
            Ok(tool_response("read_file", "tu_1")),
            Err(ProviderError::RequestFailed {
                provider: "scripted".into(),
                reason: "503".into(),
            }),
        ]);
        let session = StubSession::default();

        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &AgentLoopConfig::default(),
        )
        .await;

        assert!(matches!(
            run.result,
            Err(JobError::ProviderUnavailable { .. })
        ));
        // The first call's tokens were spent and must be reported.
        assert_eq!(run.usage, Usage { input: 200, output: 20 });
    }

    #[tokio::test]
    async fn iteration_cap_without_artifacts_is_terminal() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        let script: Vec<_> = (0..3).map(|i| Ok(tool_response("read_file", &format!("tu_{i}")))).collect();
        let gateway = gateway_with(script);
        let session = StubSession::default();

        let config = AgentLoopConfig {
            max_iterations: 3,
            max_tokens: 4096,
        };
        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &config,
        )
        .await;

        assert!(matches!(
            run.result,
            Err(JobError::MaxIterationsReached { iterations: 3 })
        ));
    }

    #[tokio::test]
    async fn iteration_cap_with_artifacts_is_a_partial_result() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        // Each round writes a file, so the workspace has artifacts.
        let script: Vec<_> = (0..2).map(|i| Ok(tool_response("write_file", &format!("tu_{i}")))).collect();
        let gateway = gateway_with(script);
        let session = StubSession::default();

        let config = AgentLoopConfig {
            max_iterations: 2,
            max_tokens: 4096,
        };
        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &config,
        )
        .await;

        let result = run.result.unwrap();
        assert_eq!(result.note, Some(CompletionNote::MaxIterationsReached));
        assert_eq!(result.output["partial"], true);
    }

    #[tokio::test]
    async fn length_finish_with_text_is_truncated_output() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        let gateway = gateway_with(vec![Ok(text_response("partial answer", FinishReason::Length))]);
        let session = StubSession::default();

        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &AgentLoopConfig::default(),
        )
        .await;

        let result = run.result.unwrap();
        assert_eq!(result.note, Some(CompletionNote::TruncatedOutput));
    }

    #[tokio::test]
    async fn cancellation_sentinel_aborts_between_iterations() {
        let store = MemoryStore::new();
        let job = seeded_job(&store).await;
        store.request_cancel(job.id).await.unwrap();

        let gateway = gateway_with(vec![Ok(text_response("x", FinishReason::EndOfTurn))]);
        let session = StubSession::default();

        let run = run(
            &job,
            &profile_for(JobType::Implement),
            "scripted",
            "m",
            &gateway,
            &session,
            &store,
            &AgentLoopConfig::default(),
        )
        .await;

        assert!(matches!(run.result, Err(JobError::Cancelled)));
        assert_eq!(run.usage, Usage::default());
    }

    #[test]
    fn initial_text_carries_payload_context() {
        let job = Job::from_submission(
            JobSubmission {
                project_id: Uuid::new_v4(),
                job_type: JobType::Implement,
                payload: json!({"task": "do it", "repo_url": "https://r"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            3,
        );
        let text = initial_task_text(&job);
        assert!(text.starts_with("do it"));
        assert!(text.contains("repo_url"));
    }
}
