//! Anthropic Messages API adapter.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::gateway::{
    ChatMessage, ContentBlock, FinishReason, ProviderAdapter, ProviderRequest, ProviderResponse,
    Role, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Render one canonical message as an Anthropic message object.
///
/// Tool results travel as `user` messages carrying `tool_result` blocks.
fn encode_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::Assistant => "assistant",
        Role::User | Role::Tool => "user",
    };
    let content: Vec<Value> = message
        .blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content})
            }
        })
        .collect();
    json!({"role": role, "content": content})
}

fn encode_request(model: &str, request: &ProviderRequest) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": request.messages.iter().map(encode_message).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
    }
    body
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ApiBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn decode_response(response: ApiResponse) -> ProviderResponse {
    let blocks: Vec<ContentBlock> = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ApiBlock::Text { text } => Some(ContentBlock::Text { text }),
            ApiBlock::ToolUse { id, name, input } => {
                Some(ContentBlock::ToolUse { id, name, input })
            }
            ApiBlock::Other => None,
        })
        .collect();

    let finish_reason = match response.stop_reason.as_deref() {
        Some("end_turn") | Some("stop_sequence") => FinishReason::EndOfTurn,
        Some("tool_use") => FinishReason::ToolUse,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Error,
    };

    ProviderResponse {
        blocks,
        finish_reason,
        usage: Usage {
            input: response.usage.input_tokens,
            output: response.usage.output_tokens,
        },
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret().as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&encode_request(model, request))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("anthropic", model, status.as_u16(), retry_after, body));
        }

        let parsed: ApiResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: "anthropic".to_string(),
                    reason: e.to_string(),
                })?;
        Ok(decode_response(parsed))
    }
}

/// Shared HTTP status classification for both adapters.
pub(crate) fn classify_status(
    provider: &str,
    model: &str,
    status: u16,
    retry_after_secs: Option<u64>,
    body: String,
) -> ProviderError {
    // Error bodies can be large; keep only the head for the job row.
    let reason: String = body.chars().take(500).collect();
    match status {
        429 => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs,
        },
        404 => ProviderError::ModelNotFound {
            provider: provider.to_string(),
            model: model.to_string(),
        },
        400..=499 => ProviderError::Rejected {
            provider: provider.to_string(),
            status,
            reason,
        },
        _ => ProviderError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {reason}"),
        },
    }
}
