//! OpenAI-compatible chat-completions adapter.
//!
//! Serves every provider speaking the OpenAI dialect (openai, groq, xai),
//! differing only in base URL and credentials.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::gateway::anthropic::classify_status;
use crate::gateway::{
    ChatMessage, ContentBlock, FinishReason, ProviderAdapter, ProviderRequest, ProviderResponse,
    Role, Usage,
};

pub struct OpenAiCompatAdapter {
    provider_id: String,
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiCompatAdapter {
    pub fn new(config: &ProviderConfig, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::RequestFailed {
                provider: config.provider.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            provider_id: config.provider.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Flatten canonical messages into the OpenAI message list.
///
/// Assistant tool-use blocks become `tool_calls` entries; each tool-result
/// block becomes its own `role: "tool"` message.
fn encode_messages(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = vec![json!({"role": "system", "content": system})];
    for message in messages {
        match message.role {
            Role::User => {
                let text: Vec<&str> = message
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                out.push(json!({"role": "user", "content": text.join("\n")}));
            }
            Role::Assistant => {
                let text: Vec<&str> = message
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                let tool_calls: Vec<Value> = message
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({"role": "assistant"});
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text.join("\n"))
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(tool_calls);
                }
                out.push(msg);
            }
            Role::Tool => {
                for block in &message.blocks {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } = block
                    {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }
    out
}

fn encode_request(model: &str, request: &ProviderRequest) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": encode_messages(&request.system, &request.messages),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn decode_response(provider: &str, response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: "response carried no choices".to_string(),
        })?;

    let mut blocks = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                ProviderError::InvalidResponse {
                    provider: provider.to_string(),
                    reason: format!("tool call arguments are not valid JSON: {e}"),
                }
            })?;
        blocks.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") => FinishReason::EndOfTurn,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Error,
    };

    let usage = response.usage.unwrap_or_default();
    Ok(ProviderResponse {
        blocks,
        finish_reason,
        usage: Usage {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
        },
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&encode_request(model, request))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                provider: self.provider_id.clone(),
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
            return Err(classify_status(
                &self.provider_id,
                model,
                status.as_u16(),
                retry_after,
                body,
            ));
        }

        let parsed: ApiResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.provider_id.clone(),
                    reason: e.to_string(),
                })?;
        decode_response(&self.provider_id, parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_flattens_tool_results_into_tool_messages() {
        let request = ProviderRequest {
            system: "sys".into(),
            messages: vec![
                ChatMessage::user("go"),
                ChatMessage::assistant(vec![
                    ContentBlock::Text {
                        text: "checking".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "list_directory".into(),
                        input: json!({"path": "."}),
                    },
                ]),
                ChatMessage::tool_results(vec![("call_1".into(), "src/".into())]),
            ],
            tools: crate::sandbox::base_tool_specs(),
            max_tokens: 1024,
        };
        let body = encode_request("gpt-4o", &request);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["name"],
            "list_directory"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][3]["function"]["name"], "run_command");
    }

    #[test]
    fn decode_parses_tool_call_arguments() {
        let parsed: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "run_command", "arguments": "{\"cmd\": \"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 80, "completion_tokens": 12}
        }))
        .unwrap();

        let response = decode_response("groq", parsed).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        let calls = response.tool_calls();
        assert_eq!(calls[0].1, "run_command");
        assert_eq!(calls[0].2["cmd"], "ls");
        assert_eq!(response.usage, Usage { input: 80, output: 12 });
    }

    #[test]
    fn decode_rejects_malformed_arguments() {
        let parsed: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "run_command", "arguments": "not json"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let err = decode_response("xai", parsed).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn decode_handles_plain_text_stop() {
        let parsed: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {"content": "all done"},
                "finish_reason": "stop"
            }]
        }))
        .unwrap();
        let response = decode_response("openai", parsed).unwrap();
        assert_eq!(response.finish_reason, FinishReason::EndOfTurn);
        assert_eq!(response.text().as_deref(), Some("all done"));
        assert_eq!(response.usage, Usage::default());
    }
}
