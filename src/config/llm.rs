use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Known providers and the env var that carries their API key.
///
/// This is the single source of truth for credential lookup; the gateway
/// registers an adapter for each provider whose key is present.
pub const PROVIDERS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("xai", "XAI_API_KEY"),
];

/// Return the env-var name for a provider, or `None` if unknown.
pub fn provider_env_key(provider: &str) -> Option<&'static str> {
    PROVIDERS
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, key)| *key)
}

/// Credentials and endpoint for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider id ("anthropic", "openai", "groq", "xai").
    pub provider: String,
    /// API key for the provider.
    pub api_key: SecretString,
    /// Base URL of the provider's API.
    pub base_url: String,
    /// Model used when neither the job nor its agent names one.
    pub default_model: String,
}

/// LLM gateway configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Providers with credentials available on this deployment.
    pub providers: Vec<ProviderConfig>,
    /// Provider used when a job has no agent assignment.
    pub default_provider: String,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// `max_tokens` sent with every provider request.
    pub max_tokens: u32,
}

fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "https://api.anthropic.com",
        "openai" => "https://api.openai.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "xai" => "https://api.x.ai/v1",
        _ => "",
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-sonnet-4-20250514",
        "openai" => "gpt-4o",
        "groq" => "llama-3.3-70b-versatile",
        "xai" => "grok-4-fast-reasoning",
        _ => "",
    }
}

impl LlmConfig {
    /// Load provider credentials from the environment.
    ///
    /// One [`ProviderConfig`] is built per provider whose key env var is
    /// set. `{PROVIDER}_BASE_URL` and `{PROVIDER}_MODEL` override the
    /// built-in endpoint and model defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut providers = Vec::new();
        for (name, key_var) in PROVIDERS {
            let Some(key) = optional_env(key_var)? else {
                continue;
            };
            let upper = name.to_uppercase();
            providers.push(ProviderConfig {
                provider: name.to_string(),
                api_key: SecretString::from(key),
                base_url: parse_string_env(&format!("{upper}_BASE_URL"), default_base_url(name))?,
                default_model: parse_string_env(&format!("{upper}_MODEL"), default_model(name))?,
            });
        }

        let default_provider = parse_string_env("LLM_DEFAULT_PROVIDER", "anthropic")?;

        Ok(Self {
            providers,
            default_provider,
            request_timeout_secs: parse_optional_env("LLM_REQUEST_TIMEOUT_SECS", 120u64)?,
            max_tokens: parse_optional_env("LLM_MAX_TOKENS", 4096u32)?,
        })
    }

    /// Look up the configured entry for a provider.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider == name)
    }
}
