// Anthropic Messages API backend.
//
// One POST to /v1/messages per chat call; no streaming. Tool results travel
// back as tool_result blocks inside a user message.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::types::{
    ChatMessage, ChatRequest, ChatResponse, Role, TokenInfo, ToolCallIntent, ToolDefinition,
};

use super::{retry_after_header, ChatBackend, LlmError};

pub(crate) struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self> {
        let base = if base_url.is_empty() {
            "https://api.anthropic.com"
        } else {
            base_url.trim_end_matches('/')
        };
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()?,
            api_key: api_key.to_string(),
            url: format!("{base}/v1/messages"),
            model: model.to_string(),
        })
    }
}

/// Build the request body for the Messages API.
fn build_request_body(model: &str, request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": convert_messages(&request.messages),
        "max_tokens": request.max_tokens,
    });

    if !request.tools.is_empty() {
        body["tools"] = json!(convert_tools(&request.tools));
    }

    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }

    body
}

/// Convert the neutral message list to Anthropic format. Tool-role messages
/// become user-role tool_result blocks.
fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut result = Vec::new();

    for msg in messages {
        match msg.role {
            Role::User => result.push(json!({
                "role": "user",
                "content": [{ "type": "text", "text": msg.content }],
            })),
            Role::Tool => result.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                    "content": msg.content,
                }],
            })),
            Role::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() {
                    content.push(json!({ "type": "text", "text": msg.content }));
                }
                for tc in &msg.tool_calls {
                    let input: Value = serde_json::from_str(&tc.arguments)
                        .unwrap_or(Value::Object(Default::default()));
                    content.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": input,
                    }));
                }
                result.push(json!({ "role": "assistant", "content": content }));
            }
        }
    }

    result
}

/// Convert tool definitions to Anthropic format.
fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect()
}

/// Pull text, tool_use blocks, and usage out of a Messages response.
fn parse_response(body: &Value) -> Result<ChatResponse, LlmError> {
    let blocks = body["content"].as_array().ok_or_else(|| {
        LlmError::InvalidResponse("response carries no content array".to_string())
    })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or("")),
            Some("tool_use") => tool_calls.push(ToolCallIntent {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                arguments: block["input"].to_string(),
            }),
            _ => {}
        }
    }

    let usage = &body["usage"];
    let tokens = TokenInfo {
        total_tokens: None,
        input_tokens: usage["input_tokens"].as_u64(),
        output_tokens: usage["output_tokens"].as_u64(),
    };

    Ok(ChatResponse {
        content,
        tool_calls,
        tokens,
    })
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = build_request_body(&self.model, &request);

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after: retry_after_header(&response),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                provider: "anthropic",
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn simple_request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            tools: vec![],
            max_tokens: 1024,
            temperature: None,
        }
    }

    #[test]
    fn test_build_request_body_basic() {
        let body = build_request_body("claude-sonnet-4", &simple_request());
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_convert_tool_result_message() {
        let msgs = vec![ChatMessage::tool("t1", "output".into())];
        let converted = convert_messages(&msgs);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[0]["content"][0]["type"], "tool_result");
        assert_eq!(converted[0]["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn test_convert_assistant_tool_use() {
        let msgs = vec![ChatMessage::assistant(
            "thinking".into(),
            vec![ToolCallIntent {
                id: "t1".into(),
                name: "search".into(),
                arguments: "{\"q\":1}".into(),
            }],
        )];
        let converted = convert_messages(&msgs);
        assert_eq!(converted[0]["content"][0]["type"], "text");
        assert_eq!(converted[0]["content"][1]["type"], "tool_use");
        assert_eq!(converted[0]["content"][1]["input"]["q"], 1);
    }

    #[test]
    fn test_parse_response_text_and_tools() {
        let body = json!({
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "t1", "name": "write_file",
                 "input": {"path": "/tmp/test.txt"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 7}
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "calling");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "write_file");
        assert_eq!(resp.tokens.effective(&resp.content), 27);
    }

    #[test]
    fn test_parse_response_missing_content() {
        assert!(parse_response(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Done!"}],
                "usage": {"input_tokens": 4, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::new("k", &server.uri(), "claude-sonnet-4").unwrap();
        let resp = backend.chat(simple_request()).await.unwrap();
        assert_eq!(resp.content, "Done!");
    }

    #[tokio::test]
    async fn test_chat_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let backend = AnthropicBackend::new("k", &server.uri(), "claude-sonnet-4").unwrap();
        assert!(matches!(
            backend.chat(simple_request()).await,
            Err(LlmError::RateLimited { .. })
        ));
    }
}
