//! Persistent-store seam.
//!
//! The relational store is a collaborator: this crate defines the
//! [`JobStore`] trait covering exactly the mutations the dispatcher
//! performs, plus [`MemoryStore`], a process-local implementation used by
//! tests and single-process deployments.
//!
//! Status transitions are conditional writes: each mutation names the
//! status it expects and fails with [`StoreError::StatusConflict`] when the
//! row has moved on. That conditional update is what makes duplicate
//! broker deliveries idempotent.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::types::{AgentRecord, AgentStatus, Job, JobStatus, JobType, Project};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError>;
    async fn job(&self, id: Uuid) -> Result<Job, StoreError>;
    async fn jobs_for_project(&self, project_id: Uuid) -> Result<Vec<Job>, StoreError>;
    async fn all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// `pending → running`; stamps `started_at` and the serving agent.
    async fn mark_running(&self, id: Uuid, agent_id: Option<Uuid>) -> Result<Job, StoreError>;

    /// Add one attempt's token usage and cost to a `running` job.
    ///
    /// Counters only ever grow: cost is monotonically non-decreasing across
    /// attempts, and usage is recorded even when the attempt later fails.
    async fn record_attempt_usage(
        &self,
        id: Uuid,
        tokens_in: u64,
        tokens_out: u64,
        cost: Decimal,
        logs: &str,
    ) -> Result<Job, StoreError>;

    /// `running → completed`; persists the result and stamps timing.
    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<Job, StoreError>;

    /// `running → failed`; records the error text.
    async fn mark_failed(&self, id: Uuid, last_error: &str) -> Result<Job, StoreError>;

    /// `failed | pending → pending` with `retry_count + 1` and a retry
    /// timestamp. The pending case covers circuit-denied admissions, which
    /// never transition the job to running.
    async fn schedule_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, StoreError>;

    /// `pending → blocked` (terminal), for budget enforcement.
    async fn mark_blocked(&self, id: Uuid, reason: &str) -> Result<Job, StoreError>;

    /// Any non-terminal status → `dead_letter` (terminal).
    async fn mark_dead_letter(&self, id: Uuid, reason: &str) -> Result<Job, StoreError>;

    /// Set the admin cancellation sentinel on a non-terminal job.
    async fn request_cancel(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Admin re-drive: `dead_letter → pending`, `retry_count = 0`, errors
    /// cleared.
    async fn reset_for_redrive(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn insert_project(&self, project: Project) -> Result<(), StoreError>;
    async fn project(&self, id: Uuid) -> Result<Project, StoreError>;

    async fn upsert_agent(&self, agent: AgentRecord) -> Result<(), StoreError>;
    async fn agent(&self, id: Uuid) -> Result<AgentRecord, StoreError>;
    async fn idle_agent_for(&self, agent_type: JobType) -> Result<Option<AgentRecord>, StoreError>;
    async fn record_heartbeat(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_job_id: Option<Uuid>,
    ) -> Result<(), StoreError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    projects: RwLock<HashMap<Uuid, Project>>,
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `mutate` to the job iff `accept` passes on its current status.
    async fn update_where<F>(
        &self,
        id: Uuid,
        expected: &'static str,
        accept: fn(JobStatus) -> bool,
        mutate: F,
    ) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound { id })?;
        if !accept(job.status) {
            return Err(StoreError::StatusConflict {
                id,
                expected,
                actual: job.status.to_string(),
            });
        }
        mutate(job);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound { id })
    }

    async fn jobs_for_project(&self, project_id: Uuid) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn mark_running(&self, id: Uuid, agent_id: Option<Uuid>) -> Result<Job, StoreError> {
        self.update_where(id, "pending", |s| s == JobStatus::Pending, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            if agent_id.is_some() {
                job.assigned_agent_id = agent_id;
            }
        })
        .await
    }

    async fn record_attempt_usage(
        &self,
        id: Uuid,
        tokens_in: u64,
        tokens_out: u64,
        cost: Decimal,
        logs: &str,
    ) -> Result<Job, StoreError> {
        self.update_where(id, "running", |s| s == JobStatus::Running, |job| {
            job.tokens_used_input += tokens_in;
            job.tokens_used_output += tokens_out;
            job.tokens_used_total = job.tokens_used_input + job.tokens_used_output;
            job.actual_cost += cost;
            job.logs = Some(logs.to_string());
        })
        .await
    }

    async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<Job, StoreError> {
        self.update_where(id, "running", |s| s == JobStatus::Running, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            let now = Utc::now();
            job.completed_at = Some(now);
            if let Some(started) = job.started_at {
                job.actual_duration_secs = Some((now - started).num_seconds());
            }
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, last_error: &str) -> Result<Job, StoreError> {
        self.update_where(id, "running", |s| s == JobStatus::Running, |job| {
            job.status = JobStatus::Failed;
            job.last_error = Some(last_error.to_string());
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, StoreError> {
        self.update_where(
            id,
            "failed or pending",
            |s| matches!(s, JobStatus::Failed | JobStatus::Pending),
            |job| {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.next_retry_at = Some(next_retry_at);
                job.last_error = Some(last_error.to_string());
            },
        )
        .await
    }

    async fn mark_blocked(&self, id: Uuid, reason: &str) -> Result<Job, StoreError> {
        self.update_where(id, "pending", |s| s == JobStatus::Pending, |job| {
            job.status = JobStatus::Blocked;
            job.failure_reason = Some(reason.to_string());
        })
        .await
    }

    async fn mark_dead_letter(&self, id: Uuid, reason: &str) -> Result<Job, StoreError> {
        self.update_where(id, "non-terminal", |s| !s.is_terminal(), |job| {
            job.status = JobStatus::DeadLetter;
            job.failure_reason = Some(reason.to_string());
            job.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update_where(id, "non-terminal", |s| !s.is_terminal(), |job| {
            job.status = JobStatus::CancelRequested;
        })
        .await
    }

    async fn reset_for_redrive(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update_where(
            id,
            "dead_letter",
            |s| s == JobStatus::DeadLetter,
            |job| {
                job.status = JobStatus::Pending;
                job.retry_count = 0;
                job.failure_reason = None;
                job.last_error = None;
                job.next_retry_at = None;
                job.completed_at = None;
            },
        )
        .await
    }

    async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        self.projects.write().await.insert(project.id, project);
        Ok(())
    }

    async fn project(&self, id: Uuid) -> Result<Project, StoreError> {
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProjectNotFound { id })
    }

    async fn upsert_agent(&self, agent: AgentRecord) -> Result<(), StoreError> {
        self.agents.write().await.insert(agent.id, agent);
        Ok(())
    }

    async fn agent(&self, id: Uuid) -> Result<AgentRecord, StoreError> {
        self.agents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::AgentNotFound { id })
    }

    async fn idle_agent_for(&self, agent_type: JobType) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| a.agent_type == agent_type && a.status == AgentStatus::Idle)
            .cloned())
    }

    async fn record_heartbeat(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        current_job_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(StoreError::AgentNotFound { id: agent_id })?;
        agent.status = status;
        agent.current_job_id = current_job_id;
        agent.last_heartbeat = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::types::{JobSubmission, JobType};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn pending_job() -> Job {
        Job::from_submission(
            JobSubmission {
                project_id: Uuid::new_v4(),
                job_type: JobType::Implement,
                payload: json!({"task": "do the thing"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            3,
        )
    }

    #[tokio::test]
    async fn running_guard_rejects_duplicate_delivery() {
        let store = MemoryStore::new();
        let job = pending_job();
        let id = job.id;
        store.insert_job(job).await.unwrap();

        store.mark_running(id, None).await.unwrap();
        // Second reservation of the same id must not re-run the job.
        let err = store.mark_running(id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn usage_and_cost_accumulate_across_attempts() {
        let store = MemoryStore::new();
        let job = pending_job();
        let id = job.id;
        store.insert_job(job).await.unwrap();

        store.mark_running(id, None).await.unwrap();
        store
            .record_attempt_usage(id, 1000, 500, dec!(0.0105), "call 1")
            .await
            .unwrap();
        store.mark_failed(id, "503").await.unwrap();
        store
            .schedule_retry(id, Utc::now(), "503")
            .await
            .unwrap();

        store.mark_running(id, None).await.unwrap();
        let job = store
            .record_attempt_usage(id, 200, 100, dec!(0.002), "call 2")
            .await
            .unwrap();

        assert_eq!(job.tokens_used_input, 1200);
        assert_eq!(job.tokens_used_output, 600);
        assert_eq!(job.tokens_used_total, 1800);
        assert_eq!(job.actual_cost, dec!(0.0125));
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let store = MemoryStore::new();
        let job = pending_job();
        let id = job.id;
        store.insert_job(job).await.unwrap();

        store.mark_dead_letter(id, "sandbox start failed").await.unwrap();
        assert!(store.mark_running(id, None).await.is_err());
        assert!(store.mark_dead_letter(id, "again").await.is_err());
        assert!(store.request_cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn redrive_resets_counters() {
        let store = MemoryStore::new();
        let mut job = pending_job();
        job.retry_count = 3;
        let id = job.id;
        store.insert_job(job).await.unwrap();

        store.mark_dead_letter(id, "max retries").await.unwrap();
        let job = store.reset_for_redrive(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.failure_reason.is_none());
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn idle_agent_lookup_matches_type() {
        let store = MemoryStore::new();
        let agent = AgentRecord {
            id: Uuid::new_v4(),
            agent_type: JobType::Test,
            provider: "groq".into(),
            model: "llama-3.3-70b-versatile".into(),
            status: AgentStatus::Idle,
            current_job_id: None,
            last_heartbeat: None,
        };
        store.upsert_agent(agent.clone()).await.unwrap();

        assert!(store.idle_agent_for(JobType::Deploy).await.unwrap().is_none());
        let found = store.idle_agent_for(JobType::Test).await.unwrap().unwrap();
        assert_eq!(found.id, agent.id);

        store
            .record_heartbeat(agent.id, AgentStatus::Busy, Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(store.idle_agent_for(JobType::Test).await.unwrap().is_none());
    }
}
