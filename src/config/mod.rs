//! Configuration for taskforge.
//!
//! Settings are loaded from environment variables, with `.env` files
//! picked up via dotenvy early in startup. Every knob has a default so a
//! bare environment still produces a runnable config (minus provider
//! credentials).

mod dispatcher;
pub(crate) mod helpers;
mod llm;
mod sandbox;

pub use self::dispatcher::{BreakerConfig, CostConfig, DispatcherConfig, RetryConfig};
pub use self::llm::{LlmConfig, PROVIDERS, ProviderConfig, provider_env_key};
pub use self::sandbox::SandboxConfig;

use crate::error::ConfigError;

/// Main configuration for the job lifecycle engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub cost: CostConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            llm: LlmConfig::from_env()?,
            sandbox: SandboxConfig::from_env()?,
            dispatcher: DispatcherConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            breaker: BreakerConfig::from_env()?,
            cost: CostConfig::from_env()?,
        })
    }
}
