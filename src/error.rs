//! Error types for taskforge.
//!
//! Each layer has its own error enum; everything converges in [`Error`].
//! Errors cross the dispatcher boundary as tagged values, never as panics:
//! the dispatcher is the single place where an error kind is translated
//! into a lifecycle action (retry, dead-letter, block).

use uuid::Uuid;

/// Top-level error type aggregating all subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Cost(#[from] CostError),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Configuration loading and parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration value: {key}")]
    MissingValue { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration parse error: {0}")]
    ParseError(String),
}

/// Persistent-store errors (the store itself is a collaborator behind
/// the `JobStore` trait).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("project {id} not found")]
    ProjectNotFound { id: Uuid },

    #[error("agent {id} not found")]
    AgentNotFound { id: Uuid },

    #[error("job {id} is '{actual}', expected '{expected}'")]
    StatusConflict {
        id: Uuid,
        expected: &'static str,
        actual: String,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Broker / queue facade errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown or already-acked receipt {receipt}")]
    UnknownReceipt { receipt: Uuid },

    #[error("malformed queue payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("broker backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the provider gateway and its adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    #[error("no adapter registered for provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error("provider '{provider}' rate limited")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Transient failure: network error, 5xx, connection reset.
    #[error("request to provider '{provider}' failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    /// Terminal failure: the provider rejected the request (4xx auth,
    /// malformed request). A retry will not help.
    #[error("provider '{provider}' rejected the request ({status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("model '{model}' not found on provider '{provider}'")]
    ModelNotFound { provider: String, model: String },

    #[error("invalid response from provider '{provider}': {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    /// Transient errors are worth retrying and count against the
    /// provider's circuit breaker; terminal errors do neither.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::RequestFailed { .. }
                | Self::InvalidResponse { .. }
                | Self::Http(_)
        )
    }
}

/// Sandbox executor errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start sandbox for job {job_id}: {reason}")]
    StartFailed { job_id: Uuid, reason: String },

    #[error("sandbox for job {job_id} exceeded its {limit_secs}s wall-clock limit")]
    Timeout { job_id: Uuid, limit_secs: u64 },

    /// Tool-level failure. Returned to the agent as a tool result, not
    /// raised as a job failure; unknown tool names land here too.
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("container engine error: {0}")]
    Engine(String),
}

/// Cost ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("no pricing known for provider '{provider}' model '{model}' and no default configured")]
    PricingUnknown { provider: String, model: String },
}

/// Job-level error classification.
///
/// This is the taxonomy the dispatcher acts on. Every failure that reaches
/// the settle step is first converted into one of these kinds; the retry
/// policy then consults [`JobError::is_retriable`] and the job row records
/// [`JobError::failure_tag`].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job payload: {reason}")]
    Validation { reason: String },

    #[error("project {project_id} budget exceeded")]
    BudgetExceeded { project_id: Uuid },

    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("provider '{provider}' rejected the job: {reason}")]
    ProviderRejected { provider: String, reason: String },

    #[error("sandbox start failed: {reason}")]
    SandboxStart { reason: String },

    #[error("sandbox timed out after {limit_secs}s")]
    SandboxTimeout { limit_secs: u64 },

    #[error("agent reached the iteration cap ({iterations}) without finishing")]
    MaxIterationsReached { iterations: u32 },

    #[error("job cancelled by user")]
    Cancelled,

    #[error("unexpected error: {reason}")]
    Unknown { reason: String },
}

impl JobError {
    /// Whether the retry policy may schedule another attempt for this kind.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ProviderUnavailable { .. }
            | Self::SandboxStart { .. }
            | Self::SandboxTimeout { .. }
            | Self::Unknown { .. } => true,
            Self::Validation { .. }
            | Self::BudgetExceeded { .. }
            | Self::ProviderRejected { .. }
            | Self::MaxIterationsReached { .. }
            | Self::Cancelled => false,
        }
    }

    /// Short tag recorded in the job row's `failure_reason` column.
    pub fn failure_tag(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation error",
            Self::BudgetExceeded { .. } => "project budget exceeded",
            Self::ProviderUnavailable { .. } => "provider unavailable",
            Self::ProviderRejected { .. } => "provider rejected",
            Self::SandboxStart { .. } => "sandbox start failed",
            Self::SandboxTimeout { .. } => "sandbox timeout",
            Self::MaxIterationsReached { .. } => "max iterations reached",
            Self::Cancelled => "cancelled by user",
            Self::Unknown { .. } => "unknown error",
        }
    }

    /// Only provider-originated failures feed the circuit breaker.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected {
                provider, reason, ..
            } => Self::ProviderRejected { provider, reason },
            ProviderError::ModelNotFound { provider, model } => Self::ProviderRejected {
                provider,
                reason: format!("model '{model}' not found"),
            },
            ProviderError::UnknownProvider { provider } => Self::ProviderRejected {
                reason: format!("no adapter registered for '{provider}'"),
                provider,
            },
            transient => {
                let provider = match &transient {
                    ProviderError::CircuitOpen { provider }
                    | ProviderError::RateLimited { provider, .. }
                    | ProviderError::RequestFailed { provider, .. }
                    | ProviderError::InvalidResponse { provider, .. } => provider.clone(),
                    _ => "unknown".to_string(),
                };
                Self::ProviderUnavailable {
                    provider,
                    reason: transient.to_string(),
                }
            }
        }
    }
}

impl From<SandboxError> for JobError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::StartFailed { reason, .. } | SandboxError::Engine(reason) => {
                Self::SandboxStart { reason }
            }
            SandboxError::Timeout { limit_secs, .. } => Self::SandboxTimeout { limit_secs },
            // Tool failures are normally absorbed into tool results by the
            // agent loop; one escaping to here is a bug in the loop, treated
            // conservatively.
            SandboxError::ToolExecutionFailed { tool, reason } => Self::Unknown {
                reason: format!("tool '{tool}' failure escaped the agent loop: {reason}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_partition() {
        assert!(
            JobError::ProviderUnavailable {
                provider: "anthropic".into(),
                reason: "503".into()
            }
            .is_retriable()
        );
        assert!(
            JobError::SandboxStart {
                reason: "image missing".into()
            }
            .is_retriable()
        );
        assert!(JobError::SandboxTimeout { limit_secs: 1800 }.is_retriable());
        assert!(
            JobError::Unknown {
                reason: "panic".into()
            }
            .is_retriable()
        );

        assert!(!JobError::Cancelled.is_retriable());
        assert!(
            !JobError::BudgetExceeded {
                project_id: Uuid::nil()
            }
            .is_retriable()
        );
        assert!(!JobError::MaxIterationsReached { iterations: 20 }.is_retriable());
        assert!(
            !JobError::ProviderRejected {
                provider: "openai".into(),
                reason: "401".into()
            }
            .is_retriable()
        );
    }

    #[test]
    fn breaker_only_counts_provider_failures() {
        assert!(
            JobError::ProviderUnavailable {
                provider: "xai".into(),
                reason: "timeout".into()
            }
            .counts_against_breaker()
        );
        assert!(
            !JobError::SandboxStart {
                reason: "daemon down".into()
            }
            .counts_against_breaker()
        );
        assert!(!JobError::Cancelled.counts_against_breaker());
    }

    #[test]
    fn provider_error_classification() {
        let transient: JobError = ProviderError::RequestFailed {
            provider: "groq".into(),
            reason: "503 service unavailable".into(),
        }
        .into();
        assert!(matches!(transient, JobError::ProviderUnavailable { .. }));

        let terminal: JobError = ProviderError::Rejected {
            provider: "anthropic".into(),
            status: 401,
            reason: "invalid api key".into(),
        }
        .into();
        assert!(matches!(terminal, JobError::ProviderRejected { .. }));

        let missing: JobError = ProviderError::ModelNotFound {
            provider: "openai".into(),
            model: "gpt-99".into(),
        }
        .into();
        assert!(matches!(missing, JobError::ProviderRejected { .. }));
    }

    #[test]
    fn failure_tags_are_stable() {
        assert_eq!(
            JobError::BudgetExceeded {
                project_id: Uuid::nil()
            }
            .failure_tag(),
            "project budget exceeded"
        );
        assert_eq!(
            JobError::SandboxStart {
                reason: "x".into()
            }
            .failure_tag(),
            "sandbox start failed"
        );
        assert_eq!(JobError::Cancelled.failure_tag(), "cancelled by user");
    }
}
