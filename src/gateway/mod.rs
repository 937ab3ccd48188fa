//! Provider gateway: one canonical message/tool schema over several LLM
//! vendors.
//!
//! Each adapter translates the canonical shape to one vendor's wire
//! protocol and normalizes its token-usage fields. The gateway wraps every
//! call with the circuit breaker: admission is checked before the request
//! and the outcome is recorded after, so an unhealthy provider is cut off
//! for every worker in the process at once.

mod anthropic;
mod openai_compat;

pub use anthropic::AnthropicAdapter;
pub use openai_compat::OpenAiCompatAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::breaker::{Admission, CircuitBreakerRegistry, Outcome};
use crate::config::LlmConfig;
use crate::error::ProviderError;
use crate::sandbox::ToolSpec;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// A canonical chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
        }
    }

    /// Tool results for one round of tool calls.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: Role::Tool,
            blocks: results
                .into_iter()
                .map(|(tool_use_id, content)| ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                })
                .collect(),
        }
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfTurn,
    ToolUse,
    Length,
    Error,
}

/// Normalized token usage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Canonical request shape, portable across adapters.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

/// Canonical response shape.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub blocks: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl ProviderResponse {
    /// Concatenated text blocks, if any.
    pub fn text(&self) -> Option<String> {
        let text: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }

    /// Tool-use blocks in request order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// One LLM vendor behind the canonical schema.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn invoke(
        &self,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Registry of adapters plus the circuit breaker wrap.
pub struct ProviderGateway {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    breaker: Arc<CircuitBreakerRegistry>,
}

impl ProviderGateway {
    pub fn new(breaker: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            adapters: HashMap::new(),
            breaker,
        }
    }

    /// Build a gateway with an adapter per configured provider.
    pub fn from_config(
        config: &LlmConfig,
        breaker: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, ProviderError> {
        let mut gateway = Self::new(breaker);
        for provider in &config.providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider.provider.as_str() {
                "anthropic" => Arc::new(AnthropicAdapter::new(
                    provider,
                    config.request_timeout_secs,
                )?),
                // Everything else configured here speaks the OpenAI
                // chat-completions dialect at its own base URL.
                _ => Arc::new(OpenAiCompatAdapter::new(
                    provider,
                    config.request_timeout_secs,
                )?),
            };
            gateway.register(adapter);
        }
        Ok(gateway)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.adapters.contains_key(provider)
    }

    /// Invoke a provider through its adapter.
    ///
    /// Admission is checked after the adapter lookup so an unknown
    /// provider never consumes a half-open probe. Success and transient
    /// failure are recorded on the breaker; terminal rejections are not —
    /// a misconfigured API key says nothing about provider health.
    pub async fn invoke(
        &self,
        provider: &str,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let adapter = self
            .adapters
            .get(provider)
            .ok_or_else(|| ProviderError::UnknownProvider {
                provider: provider.to_string(),
            })?;

        if self.breaker.admit(provider) == Admission::Denied {
            return Err(ProviderError::CircuitOpen {
                provider: provider.to_string(),
            });
        }

        match adapter.invoke(model, request).await {
            Ok(response) => {
                self.breaker.record(provider, Outcome::Success);
                Ok(response)
            }
            Err(err) => {
                if err.is_transient() {
                    self.breaker.record(provider, Outcome::Failure);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for FailingAdapter {
        fn provider_id(&self) -> &str {
            "flaky"
        }

        async fn invoke(
            &self,
            _model: &str,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::RequestFailed {
                provider: "flaky".to_string(),
                reason: "503".to_string(),
            })
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            system: "s".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![],
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn open_circuit_stops_reaching_the_adapter() {
        let breaker = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 5,
            open_timeout: std::time::Duration::from_secs(60),
        }));
        let adapter = Arc::new(FailingAdapter {
            calls: AtomicU32::new(0),
        });
        let mut gateway = ProviderGateway::new(breaker);
        gateway.register(adapter.clone());

        // Five consecutive transient failures open the circuit.
        for _ in 0..5 {
            let err = gateway.invoke("flaky", "m", &request()).await.unwrap_err();
            assert!(matches!(err, ProviderError::RequestFailed { .. }));
        }
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 5);

        // While open, no provider call is issued at all.
        let err = gateway.invoke("flaky", "m", &request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unknown_provider_is_terminal_and_untracked() {
        let breaker = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let gateway = ProviderGateway::new(breaker.clone());
        let err = gateway.invoke("nobody", "m", &request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider { .. }));
        assert_eq!(
            breaker.state("nobody"),
            crate::breaker::CircuitState::Closed
        );
    }

    #[test]
    fn response_accessors() {
        let response = ProviderResponse {
            blocks: vec![
                ContentBlock::Text {
                    text: "working on it".into(),
                },
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "read_file".into(),
                    input: serde_json::json!({"path": "a.txt"}),
                },
            ],
            finish_reason: FinishReason::ToolUse,
            usage: Usage {
                input: 10,
                output: 5,
            },
        };
        assert_eq!(response.text().as_deref(), Some("working on it"));
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.usage.total(), 15);
    }
}
