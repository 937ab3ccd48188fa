//! Core row types: jobs, projects, agents, and queue envelopes.
//!
//! The persistent store owns these rows; the dispatcher mutates them only
//! through the [`crate::job::JobStore`] seam while holding a broker
//! reservation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
///
/// `Completed`, `Blocked`, and `DeadLetter` are terminal; `CancelRequested`
/// is the admin-cancellation sentinel checked by the agent loop between
/// iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    DeadLetter,
    CancelRequested,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::DeadLetter => "dead_letter",
            Self::CancelRequested => "cancel_requested",
        }
    }

    /// Terminal statuses never change again except via admin re-drive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked | Self::DeadLetter)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task category a job belongs to; selects the agent profile that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Design,
    Implement,
    Review,
    Test,
    Deploy,
    Monitor,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Design => "design",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Monitor => "monitor",
        }
    }

    pub const ALL: [JobType; 6] = [
        Self::Design,
        Self::Implement,
        Self::Review,
        Self::Test,
        Self::Deploy,
        Self::Monitor,
    ];
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "design" => Ok(Self::Design),
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "test" => Ok(Self::Test),
            "deploy" => Ok(Self::Deploy),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!(
                "invalid job type '{other}', expected one of: design, implement, review, test, deploy, monitor"
            )),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Advisory routing hint; the dispatcher may serve the job with any
    /// compatible agent of the same type.
    pub assigned_agent_id: Option<Uuid>,
    pub job_type: JobType,
    /// Task description plus optional parameters; opaque to the queue.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub tokens_used_input: u64,
    pub tokens_used_output: u64,
    pub tokens_used_total: u64,
    pub estimated_cost: Option<Decimal>,
    pub actual_cost: Decimal,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the final attempt, in seconds.
    pub actual_duration_secs: Option<i64>,
    pub result: Option<serde_json::Value>,
    /// Truncated transcript of the agent run.
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending row from a submission.
    pub fn from_submission(submission: JobSubmission, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: submission.project_id,
            assigned_agent_id: submission.assigned_agent_id,
            job_type: submission.job_type,
            payload: submission.payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(default_max_retries),
            failure_reason: None,
            last_error: None,
            next_retry_at: None,
            tokens_used_input: 0,
            tokens_used_output: 0,
            tokens_used_total: 0,
            estimated_cost: None,
            actual_cost: Decimal::ZERO,
            started_at: None,
            completed_at: None,
            actual_duration_secs: None,
            result: None,
            logs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The task text handed to the agent: the payload's `task` field, or
    /// the whole payload serialized when no such field exists.
    pub fn task_description(&self) -> String {
        self.payload
            .get("task")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.payload.to_string())
    }
}

/// Inbound job record from the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub project_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub assigned_agent_id: Option<Uuid>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A project groups jobs under an optional budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// USD cap on total spend; `None` means no cap.
    pub budget_allocated: Option<Decimal>,
}

/// Availability state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

/// A registered agent: a profile binding plus provider/model routing.
/// Owned by the HTTP layer; the dispatcher reads rows and writes
/// heartbeats only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub agent_type: JobType,
    pub provider: String,
    pub model: String,
    pub status: AgentStatus,
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Payload carried on the incoming queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub attempt: u32,
}

/// Payload carried on the delayed-retry queue, ordered by `due_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub job_id: Uuid,
    pub attempt: u32,
    /// Epoch seconds.
    pub due_at: i64,
}

/// Payload carried on the dead-letter queue for manual inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub failure_reason: String,
    /// Total attempts made: the initial run plus every retry.
    pub attempts: u32,
    pub moved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Blocked,
            JobStatus::DeadLetter,
            JobStatus::CancelRequested,
        ] {
            let encoded = serde_json::to_string(&status).unwrap();
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(JobStatus::DeadLetter.as_str(), "dead_letter");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Blocked.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn job_type_parses() {
        assert_eq!("implement".parse::<JobType>().unwrap(), JobType::Implement);
        assert_eq!("TEST".parse::<JobType>().unwrap(), JobType::Test);
        assert!("gardening".parse::<JobType>().is_err());
    }

    #[test]
    fn task_description_prefers_task_field() {
        let submission = JobSubmission {
            project_id: Uuid::new_v4(),
            job_type: JobType::Implement,
            payload: json!({"task": "add a login page", "repo_url": "https://example.com/r.git"}),
            assigned_agent_id: None,
            max_retries: None,
        };
        let job = Job::from_submission(submission, 3);
        assert_eq!(job.task_description(), "add a login page");
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.status, JobStatus::Pending);
    }
}
