//! Retry policy: retry-vs-dead-letter decisions and backoff arithmetic.
//!
//! Delays grow exponentially from the base (60s, 120s, 240s, ...) up to
//! the ceiling (480s), with ±15% jitter so synchronized failures don't
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::JobError;

/// What the dispatcher should do with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue via the delayed queue after `delay`.
    Retry { delay: Duration },
    /// Move to the dead-letter queue with this reason.
    DeadLetter { reason: String },
}

/// Decide retry vs. dead-letter for a failure.
///
/// Terminal error kinds dead-letter immediately regardless of the
/// counters; retriable kinds retry while `retry_count < max_retries`.
pub fn decide(
    config: &RetryConfig,
    retry_count: u32,
    max_retries: u32,
    error: &JobError,
) -> RetryDecision {
    if !error.is_retriable() {
        return RetryDecision::DeadLetter {
            reason: error.failure_tag().to_string(),
        };
    }
    if retry_count >= max_retries {
        return RetryDecision::DeadLetter {
            reason: format!(
                "max retries ({max_retries}) exceeded, last error: {}",
                error.failure_tag()
            ),
        };
    }
    RetryDecision::Retry {
        delay: backoff_delay(config, retry_count),
    }
}

/// `min(base · 2^retry_count, ceiling)`, optionally jittered by ±15%.
pub fn backoff_delay(config: &RetryConfig, retry_count: u32) -> Duration {
    let base_ms = config.base_delay_secs.saturating_mul(1000);
    let ceiling_ms = config.max_delay_secs.saturating_mul(1000);
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(retry_count))
        .min(ceiling_ms);

    if !config.jitter {
        return Duration::from_millis(delay_ms);
    }

    let jitter_range = delay_ms * 15 / 100;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    Duration::from_millis((delay_ms as i64 + jitter).max(0) as u64)
}
