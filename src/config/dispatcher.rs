use std::time::Duration;

use rust_decimal::Decimal;

use crate::config::helpers::{parse_bool_env, parse_option_env, parse_optional_env};
use crate::error::ConfigError;

/// Dispatcher worker configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of parallel worker tasks sharing the broker.
    pub workers: usize,
    /// Broker reservation visibility timeout; must cover worst-case agent
    /// runtime so a live worker never loses its reservation.
    pub visibility_timeout_secs: u64,
    /// Idle sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Interval between agent heartbeat writes.
    pub heartbeat_interval_secs: u64,
    /// `max_retries` applied to jobs submitted without one.
    pub default_max_retries: u32,
    /// Iteration cap for the agent loop.
    pub max_iterations: u32,
    /// Job transcript logs are truncated to this many bytes before persisting.
    pub log_limit_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            visibility_timeout_secs: 2100,
            poll_interval_ms: 1000,
            heartbeat_interval_secs: 30,
            default_max_retries: 3,
            max_iterations: 20,
            log_limit_bytes: 64 * 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            workers: parse_optional_env("DISPATCHER_WORKERS", defaults.workers)?,
            visibility_timeout_secs: parse_optional_env(
                "DISPATCHER_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            poll_interval_ms: parse_optional_env(
                "DISPATCHER_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            heartbeat_interval_secs: parse_optional_env(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            default_max_retries: parse_optional_env("MAX_RETRIES", defaults.default_max_retries)?,
            max_iterations: parse_optional_env("MAX_ITERATIONS", defaults.max_iterations)?,
            log_limit_bytes: parse_optional_env("JOB_LOG_LIMIT_BYTES", defaults.log_limit_bytes)?,
        })
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Retry backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First-retry delay.
    pub base_delay_secs: u64,
    /// Backoff ceiling.
    pub max_delay_secs: u64,
    /// Apply ±15% jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 480,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_delay_secs: parse_optional_env("RETRY_BASE_DELAY_SECS", defaults.base_delay_secs)?,
            max_delay_secs: parse_optional_env("RETRY_MAX_DELAY_SECS", defaults.max_delay_secs)?,
            jitter: parse_bool_env("RETRY_JITTER", defaults.jitter)?,
        })
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before a provider's circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects admissions before probing.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            failure_threshold: parse_optional_env(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            open_timeout: Duration::from_secs(parse_optional_env(
                "BREAKER_OPEN_TIMEOUT_SECS",
                defaults.open_timeout.as_secs(),
            )?),
        })
    }
}

/// Cost ledger configuration.
#[derive(Debug, Clone, Default)]
pub struct CostConfig {
    /// Fallback USD-per-million-token prices applied when a
    /// (provider, model) pair is missing from the price table.
    /// `None` makes unknown pairs a hard error.
    pub default_input_price: Option<Decimal>,
    pub default_output_price: Option<Decimal>,
}

impl CostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            default_input_price: parse_option_env("COST_DEFAULT_INPUT_PRICE")?,
            default_output_price: parse_option_env("COST_DEFAULT_OUTPUT_PRICE")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_match_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay_secs, 60);
        assert_eq!(config.max_delay_secs, 480);
        assert!(config.jitter);
    }

    #[test]
    fn breaker_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.open_timeout, Duration::from_secs(60));
    }
}
