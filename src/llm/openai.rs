// OpenAI Chat Completions API backend.
//
// Also serves OpenAI-compatible APIs (Groq, Gemini's OpenAI surface) and
// Azure OpenAI deployments. One POST per chat call; no streaming.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::types::{
    ChatMessage, ChatRequest, ChatResponse, Role, TokenInfo, ToolCallIntent, ToolDefinition,
};

use super::{retry_after_header, ChatBackend, LlmError};

pub(crate) struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    /// Azure sends the key in an `api-key` header instead of a bearer token.
    azure_key_header: bool,
}

impl OpenAiBackend {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: client()?,
            api_key: api_key.to_string(),
            url: format!("{base}/chat/completions"),
            model: model.to_string(),
            azure_key_header: false,
        })
    }

    pub fn azure(
        api_key: &str,
        base_url: &str,
        deployment: &str,
        api_version: &str,
        entra_id: bool,
    ) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: client()?,
            api_key: api_key.to_string(),
            url: format!(
                "{base}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            ),
            model: deployment.to_string(),
            azure_key_header: !entra_id,
        })
    }
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?)
}

/// Build the request body for the Chat Completions API.
fn build_request_body(model: &str, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(convert_message).collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });

    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }

    if !request.tools.is_empty() {
        body["tools"] = json!(convert_tools(&request.tools));
    }

    body
}

/// Convert a single message to Chat Completions format.
fn convert_message(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::User => json!({
            "role": "user",
            "content": msg.content,
        }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut value = json!({ "role": "assistant" });
            if !msg.content.is_empty() {
                value["content"] = json!(msg.content);
            }
            if !msg.tool_calls.is_empty() {
                value["tool_calls"] = json!(msg
                    .tool_calls
                    .iter()
                    .map(|tc| json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments,
                        }
                    }))
                    .collect::<Vec<_>>());
            }
            value
        }
    }
}

/// Convert tool definitions to Chat Completions format.
fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

/// Pull the assistant turn and usage out of a completion response.
fn parse_response(body: &Value) -> Result<ChatResponse, LlmError> {
    let message = &body["choices"][0]["message"];
    if message.is_null() {
        return Err(LlmError::InvalidResponse(
            "response carries no choices[0].message".to_string(),
        ));
    }

    let content = message["content"].as_str().unwrap_or("").to_string();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let name = tc["function"]["name"].as_str()?;
                    Some(ToolCallIntent {
                        id: tc["id"].as_str().unwrap_or("").to_string(),
                        name: name.to_string(),
                        arguments: tc["function"]["arguments"]
                            .as_str()
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = &body["usage"];
    let tokens = TokenInfo {
        total_tokens: usage["total_tokens"].as_u64(),
        input_tokens: usage["prompt_tokens"].as_u64(),
        output_tokens: usage["completion_tokens"].as_u64(),
    };

    Ok(ChatResponse {
        content,
        tool_calls,
        tokens,
    })
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = build_request_body(&self.model, &request);

        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");

        if !self.api_key.is_empty() {
            if self.azure_key_header {
                req = req.header("api-key", &self.api_key);
            } else {
                req = req.header("authorization", format!("Bearer {}", self.api_key));
            }
        }

        let response = req.json(&body).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after: retry_after_header(&response),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "openai",
                status: status.as_u16(),
                message,
            });
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_response(&parsed)
    }
}
