//! Dispatcher: the reservation-to-settlement worker loop.
//!
//! ```text
//! incoming ──reserve──▶ guard ──admit──▶ run ──settle──▶ ack
//!                 │        │                    │
//!                 │        └─ budget exceeded ─▶ blocked
//!                 │        └─ circuit denied ──▶ delayed retry
//!                 │                             │
//!                 └─ duplicate delivery ─▶ ack  ├─▶ completed
//!                                               ├─▶ delayed retry ──▶ incoming (pump)
//!                                               └─▶ dead letter
//! ```
//!
//! Multiple workers share the broker and the store; idempotency comes from
//! the `status = pending` guard re-checked on every reservation, and cost
//! updates go through the store's running-guarded conditional writes.
//! The dispatcher is the only component that translates an error kind into
//! a lifecycle action.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::agent::{AgentLoopConfig, CompletionNote, agent_loop, profile_for};
use crate::breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::cost::{BudgetLevel, CostLedger};
use crate::error::{Error, JobError, SandboxError, StoreError};
use crate::gateway::ProviderGateway;
use crate::job::{
    AgentStatus, DeadLetterEnvelope, Job, JobStatus, JobStore, JobSubmission, JobTicket,
    RetryEnvelope,
};
use crate::queue::{Broker, DEAD_LETTER, INCOMING, RETRY_SCHEDULE, Receipt};
use crate::retry::{RetryDecision, decide};
use crate::sandbox::{SandboxLauncher, truncate_to_bytes};

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    gateway: Arc<ProviderGateway>,
    sandbox: Arc<dyn SandboxLauncher>,
    breaker: Arc<CircuitBreakerRegistry>,
    ledger: CostLedger,
    config: Config,
    job_timeout: Duration,
}

/// What a single tick did, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Queue was empty.
    Idle,
    /// Reservation acked without running (duplicate, malformed, missing row).
    Skipped(Option<Uuid>),
    Blocked(Uuid),
    RetryScheduled(Uuid),
    Completed(Uuid),
    DeadLettered(Uuid),
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        gateway: Arc<ProviderGateway>,
        sandbox: Arc<dyn SandboxLauncher>,
        breaker: Arc<CircuitBreakerRegistry>,
        config: Config,
    ) -> Self {
        let ledger = CostLedger::new(store.clone(), config.cost.clone());
        let job_timeout = Duration::from_secs(config.sandbox.job_timeout_secs);
        Self {
            store,
            broker,
            gateway,
            sandbox,
            breaker,
            ledger,
            config,
            job_timeout,
        }
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    /// Persist a submission as a pending job and publish its ticket.
    ///
    /// Malformed payloads are rejected here and never enter the pipeline.
    pub async fn enqueue(&self, submission: JobSubmission) -> Result<Uuid, Error> {
        let task_ok = submission
            .payload
            .get("task")
            .and_then(|v| v.as_str())
            .is_some_and(|t| !t.trim().is_empty());
        if !submission.payload.is_object() || !task_ok {
            return Err(JobError::Validation {
                reason: "payload must be an object with a non-empty 'task' string".to_string(),
            }
            .into());
        }

        let job = Job::from_submission(submission, self.config.dispatcher.default_max_retries);
        let id = job.id;
        self.store.insert_job(job).await?;
        self.broker
            .publish(INCOMING, serde_json::to_value(JobTicket { job_id: id, attempt: 0 }).unwrap_or_default())
            .await?;
        tracing::info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Process at most one reservation.
    pub async fn tick(&self) -> Result<TickOutcome, Error> {
        let Some((receipt, payload)) = self
            .broker
            .reserve(INCOMING, self.config.dispatcher.visibility_timeout())
            .await?
        else {
            return Ok(TickOutcome::Idle);
        };

        let ticket: JobTicket = match serde_json::from_value(payload) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed queue payload");
                self.broker.ack(&receipt).await?;
                return Ok(TickOutcome::Skipped(None));
            }
        };
        let job_id = ticket.job_id;

        let job = match self.store.job(job_id).await {
            Ok(job) => job,
            Err(StoreError::JobNotFound { .. }) => {
                tracing::warn!(job_id = %job_id, "reserved ticket for unknown job");
                self.broker.ack(&receipt).await?;
                return Ok(TickOutcome::Skipped(Some(job_id)));
            }
            Err(e) => return Err(e.into()),
        };

        // Idempotency guard: at-least-once delivery means duplicates happen.
        match job.status {
            JobStatus::Pending => {}
            JobStatus::CancelRequested => {
                self.dead_letter(&job, JobError::Cancelled.failure_tag())
                    .await?;
                self.broker.ack(&receipt).await?;
                return Ok(TickOutcome::DeadLettered(job_id));
            }
            other => {
                tracing::info!(job_id = %job_id, status = %other, "duplicate delivery, skipping");
                self.broker.ack(&receipt).await?;
                return Ok(TickOutcome::Skipped(Some(job_id)));
            }
        }

        // Budget guard: no provider call for a project that is over cap.
        if self.budget_exceeded(&job).await? {
            self.store
                .mark_blocked(job_id, "project budget exceeded")
                .await?;
            tracing::warn!(job_id = %job_id, project_id = %job.project_id, "job blocked: project budget exceeded");
            self.broker.ack(&receipt).await?;
            return Ok(TickOutcome::Blocked(job_id));
        }

        // Route, then consult the circuit before touching the job status.
        // This is a non-mutating peek: the gateway's own admit() is the
        // single gate that may consume the half-open probe, immediately
        // before the real provider request.
        let (provider, model, serving_agent) = self.resolve_route(&job).await;
        if !self.breaker.would_admit(&provider) {
            let err = JobError::ProviderUnavailable {
                provider: provider.clone(),
                reason: "circuit open".to_string(),
            };
            let outcome = self.settle_failure(&job, err, false).await?;
            self.broker.ack(&receipt).await?;
            return Ok(outcome);
        }

        let outcome = self.run_reserved(&job, &provider, &model, serving_agent).await?;
        self.broker.ack(&receipt).await?;
        Ok(outcome)
    }

    async fn budget_exceeded(&self, job: &Job) -> Result<bool, Error> {
        match self.ledger.budget_status(job.project_id).await {
            Ok(status) => Ok(status.level == BudgetLevel::Exceeded),
            Err(StoreError::ProjectNotFound { .. }) => {
                tracing::warn!(project_id = %job.project_id, "job references unknown project, treating as unbudgeted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve provider, model, and the serving agent row.
    ///
    /// The enqueue-time assignment is advisory: if that agent is missing,
    /// offline, or routed at a provider we have no adapter for, any idle
    /// agent of the same type may serve, falling back to config defaults.
    async fn resolve_route(&self, job: &Job) -> (String, String, Option<Uuid>) {
        if let Some(agent_id) = job.assigned_agent_id
            && let Ok(agent) = self.store.agent(agent_id).await
            && agent.status != AgentStatus::Offline
            && self.gateway.has_provider(&agent.provider)
        {
            return (agent.provider, agent.model, Some(agent.id));
        }

        if let Ok(Some(agent)) = self.store.idle_agent_for(job.job_type).await
            && self.gateway.has_provider(&agent.provider)
        {
            return (agent.provider, agent.model, Some(agent.id));
        }

        let llm = &self.config.llm;
        if let Some(provider) = llm.provider(&llm.default_provider) {
            return (provider.provider.clone(), provider.default_model.clone(), None);
        }
        match llm.providers.first() {
            Some(provider) => (provider.provider.clone(), provider.default_model.clone(), None),
            None => (llm.default_provider.clone(), String::new(), None),
        }
    }

    /// Run one admitted attempt: `pending → running`, sandbox, agent loop,
    /// settle.
    async fn run_reserved(
        &self,
        job: &Job,
        provider: &str,
        model: &str,
        serving_agent: Option<Uuid>,
    ) -> Result<TickOutcome, Error> {
        let job = match self.store.mark_running(job.id, serving_agent).await {
            Ok(job) => job,
            Err(StoreError::StatusConflict { .. }) => {
                // Another worker won the race on a duplicate delivery.
                return Ok(TickOutcome::Skipped(Some(job.id)));
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(agent_id) = serving_agent {
            let _ = self
                .store
                .record_heartbeat(agent_id, AgentStatus::Busy, Some(job.id))
                .await;
        }
        tracing::info!(job_id = %job.id, job_type = %job.job_type, provider, model, "job started");

        let outcome = self.execute_attempt(&job, provider, model).await;

        if let Some(agent_id) = serving_agent {
            let _ = self
                .store
                .record_heartbeat(agent_id, AgentStatus::Idle, None)
                .await;
        }
        outcome
    }

    async fn execute_attempt(
        &self,
        job: &Job,
        provider: &str,
        model: &str,
    ) -> Result<TickOutcome, Error> {
        let profile = profile_for(job.job_type);
        let session = match self
            .sandbox
            .launch(job, job.retry_count, &profile.extra_tools)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                let err: JobError = err.into();
                return self.settle_failure(job, err, true).await;
            }
        };

        let loop_config = AgentLoopConfig {
            max_iterations: self.config.dispatcher.max_iterations,
            max_tokens: self.config.llm.max_tokens,
        };

        let run = tokio::time::timeout(
            self.job_timeout,
            agent_loop::run(
                job,
                &profile,
                provider,
                model,
                &self.gateway,
                session.as_ref(),
                self.store.as_ref(),
                &loop_config,
            ),
        )
        .await;

        // Teardown on every exit path, timeout included.
        session.close().await;

        let run = match run {
            Ok(run) => run,
            Err(_) => {
                let err = SandboxError::Timeout {
                    job_id: job.id,
                    limit_secs: self.job_timeout.as_secs(),
                };
                return self.settle_failure(job, err.into(), true).await;
            }
        };

        // Tokens were spent whether or not the attempt succeeded.
        let cost = match self
            .ledger
            .cost_of(provider, model, run.usage.input, run.usage.output)
        {
            Ok(cost) => cost,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "pricing unknown, recording zero cost");
                Decimal::ZERO
            }
        };
        let (logs, _) = truncate_to_bytes(&run.transcript, self.config.dispatcher.log_limit_bytes);
        self.store
            .record_attempt_usage(job.id, run.usage.input, run.usage.output, cost, &logs)
            .await?;

        match run.result {
            Ok(result) => {
                let mut output = result.output;
                match result.note {
                    Some(CompletionNote::TruncatedOutput) => {
                        output["note"] = json!("truncated_output");
                    }
                    Some(CompletionNote::MaxIterationsReached) => {
                        output["note"] = json!("max_iterations_reached");
                    }
                    None => {}
                }
                let job = self.store.complete(job.id, output).await?;
                tracing::info!(
                    job_id = %job.id,
                    iterations = run.iterations,
                    tokens = job.tokens_used_total,
                    cost = %job.actual_cost,
                    "job completed"
                );
                Ok(TickOutcome::Completed(job.id))
            }
            Err(err) => self.settle_failure(job, err, true).await,
        }
    }

    /// Apply the retry policy to a failed attempt.
    ///
    /// `was_running` distinguishes attempts that had transitioned to
    /// `running` from admission-time denials, which never leave `pending`.
    /// Provider failures were already recorded on the breaker by the
    /// gateway at call time.
    async fn settle_failure(
        &self,
        job: &Job,
        err: JobError,
        was_running: bool,
    ) -> Result<TickOutcome, Error> {
        let message = err.to_string();
        tracing::warn!(job_id = %job.id, error = %message, retry_count = job.retry_count, "attempt failed");

        if was_running {
            self.store.mark_failed(job.id, &message).await?;
        }

        match decide(&self.config.retry, job.retry_count, job.max_retries, &err) {
            RetryDecision::Retry { delay } => {
                let due_at = Utc::now()
                    + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::seconds(60));
                let updated = self.store.schedule_retry(job.id, due_at, &message).await?;
                self.broker
                    .schedule(
                        RETRY_SCHEDULE,
                        serde_json::to_value(RetryEnvelope {
                            job_id: job.id,
                            attempt: updated.retry_count,
                            due_at: due_at.timestamp(),
                        })
                        .unwrap_or_default(),
                        due_at,
                    )
                    .await?;
                tracing::info!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    delay_secs = delay.as_secs(),
                    "retry scheduled"
                );
                Ok(TickOutcome::RetryScheduled(job.id))
            }
            RetryDecision::DeadLetter { reason } => {
                let short = err.failure_tag();
                self.dead_letter(job, short).await?;
                tracing::error!(job_id = %job.id, reason = %reason, "job dead-lettered");
                Ok(TickOutcome::DeadLettered(job.id))
            }
        }
    }

    async fn dead_letter(&self, job: &Job, reason: &str) -> Result<(), Error> {
        let updated = self.store.mark_dead_letter(job.id, reason).await?;
        self.broker
            .publish(
                DEAD_LETTER,
                serde_json::to_value(DeadLetterEnvelope {
                    job_id: updated.id,
                    project_id: updated.project_id,
                    job_type: updated.job_type,
                    failure_reason: reason.to_string(),
                    attempts: updated.retry_count + 1,
                    moved_at: Utc::now(),
                })
                .unwrap_or_default(),
            )
            .await?;
        Ok(())
    }

    /// Move due retry envelopes back onto the incoming queue.
    pub async fn pump_due(&self) -> Result<usize, Error> {
        let envelopes = self.broker.due(RETRY_SCHEDULE, Utc::now()).await?;
        let mut moved = 0;
        for payload in envelopes {
            let envelope: RetryEnvelope = match serde_json::from_value(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed retry envelope");
                    continue;
                }
            };
            self.broker
                .publish(
                    INCOMING,
                    serde_json::to_value(JobTicket {
                        job_id: envelope.job_id,
                        attempt: envelope.attempt,
                    })
                    .unwrap_or_default(),
                )
                .await?;
            tracing::info!(job_id = %envelope.job_id, attempt = envelope.attempt, "retry due, re-queued");
            moved += 1;
        }
        Ok(moved)
    }

    /// Admin re-drive of a dead-lettered job: reset counters and re-queue.
    pub async fn redrive(&self, job_id: Uuid) -> Result<(), Error> {
        let job = self.store.reset_for_redrive(job_id).await?;
        self.broker
            .publish(
                INCOMING,
                serde_json::to_value(JobTicket {
                    job_id: job.id,
                    attempt: 0,
                })
                .unwrap_or_default(),
            )
            .await?;
        tracing::info!(job_id = %job_id, "job restored from dead letter queue");
        Ok(())
    }

    /// Drain up to `limit` dead-letter envelopes for inspection.
    pub async fn take_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEnvelope>, Error> {
        let mut envelopes = Vec::new();
        for _ in 0..limit {
            let Some((receipt, payload)) = self
                .broker
                .reserve(DEAD_LETTER, Duration::from_secs(30))
                .await?
            else {
                break;
            };
            self.ack_quietly(&receipt).await;
            match serde_json::from_value(payload) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => tracing::warn!(error = %e, "skipping malformed dead-letter envelope"),
            }
        }
        Ok(envelopes)
    }

    async fn ack_quietly(&self, receipt: &Receipt) {
        if let Err(e) = self.broker.ack(receipt).await {
            tracing::warn!(error = %e, "failed to ack reservation");
        }
    }

    /// Worker loop: pump due retries, process reservations, idle-sleep on
    /// an empty queue. Returns when `shutdown` flips to true.
    pub async fn run_worker(
        &self,
        worker: usize,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        tracing::info!(worker, "dispatcher worker started");
        let poll = Duration::from_millis(self.config.dispatcher.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.pump_due().await {
                tracing::error!(worker, error = %e, "retry pump failed");
            }
            match self.tick().await {
                Ok(TickOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(worker, error = %e, "tick failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        tracing::info!(worker, "dispatcher worker stopped");
    }
}
