use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Role {
    User,
    Assistant,
    Tool,
}

/// A message in the LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub role: Role,

    pub content: String,

    /// Tool-call intents carried by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallIntent>,

    /// Id of the call a tool-role message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: text.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: String, tool_calls: Vec<ToolCallIntent>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: &str, content: String) -> Self {
        Self {
            role: Role::Tool,
            content,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// An LLM-issued intent to invoke a named tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ToolCallIntent {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the argument object, exactly as the model sent it.
    pub arguments: String,
}

/// A request to send to the LLM.
#[derive(Debug, Clone)]
pub(crate) struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A complete (non-streamed) LLM response.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallIntent>,
    pub tokens: TokenInfo,
}

/// Token usage as reported by a backend; any field may be missing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) struct TokenInfo {
    pub total_tokens: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl TokenInfo {
    /// Tokens to charge for one call: the backend's total, else the sum of
    /// input and output, else a chars/4 estimate of the content.
    pub fn effective(&self, content: &str) -> u64 {
        if let Some(total) = self.total_tokens {
            return total;
        }
        match (self.input_tokens, self.output_tokens) {
            (None, None) => (content.len() / 4) as u64,
            (input, output) => input.unwrap_or(0) + output.unwrap_or(0),
        }
    }
}

/// A tool definition presented to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One content item of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// The result of one tool invocation as returned by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ToolOutcome {
    pub content: Vec<ContentItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,

    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn text(text: String) -> Self {
        Self {
            content: vec![ContentItem {
                kind: "text".to_string(),
                text,
            }],
            structured: None,
            is_error: false,
        }
    }

    pub fn error(text: String) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// The first text content entry, or "" when the server sent none.
    pub fn first_text(&self) -> &str {
        self.content
            .iter()
            .find(|c| c.kind == "text")
            .map(|c| c.text.as_str())
            .unwrap_or("")
    }
}

/// A message as recorded in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TraceMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One dispatched tool call in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolCallRecord {
    pub name: String,
    pub parameters: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: ToolOutcome,
}

/// Rate-limit shaping counters for one execution (or one provider).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RateLimitStats {
    /// 429 responses seen.
    pub hits: u64,
    /// Attempts after the first.
    pub retries: u64,
    pub total_wait_ms: u64,
    pub retry_successes: u64,
}

impl RateLimitStats {
    pub fn delta_since(&self, earlier: &RateLimitStats) -> RateLimitStats {
        RateLimitStats {
            hits: self.hits - earlier.hits,
            retries: self.retries - earlier.retries,
            total_wait_ms: self.total_wait_ms - earlier.total_wait_ms,
            retry_successes: self.retry_successes - earlier.retry_successes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClarificationStats {
    pub count: u64,
    /// Iteration numbers at which clarifications were detected.
    pub iterations: Vec<u32>,
    pub examples: Vec<String>,
}

/// The immutable artifact of one agent run over one test; the sole input to
/// the assertion evaluator and the reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecutionRecord {
    pub test_name: String,
    pub agent_name: String,
    pub provider_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub messages: Vec<TraceMessage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_output: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub errors: Vec<String>,
    pub rate_limit_stats: RateLimitStats,
    pub clarification_stats: ClarificationStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_precedence_total_wins() {
        let info = TokenInfo {
            total_tokens: Some(50),
            input_tokens: Some(100),
            output_tokens: Some(100),
        };
        assert_eq!(info.effective("irrelevant"), 50);
    }

    #[test]
    fn test_token_precedence_sum() {
        let info = TokenInfo {
            total_tokens: None,
            input_tokens: Some(30),
            output_tokens: Some(12),
        };
        assert_eq!(info.effective(""), 42);
    }

    #[test]
    fn test_token_precedence_partial_sum() {
        let info = TokenInfo {
            total_tokens: None,
            input_tokens: Some(30),
            output_tokens: None,
        };
        assert_eq!(info.effective(""), 30);
    }

    #[test]
    fn test_token_fallback_estimate() {
        let info = TokenInfo::default();
        assert_eq!(info.effective("12345678"), 2);
        assert_eq!(info.effective(""), 0);
    }

    #[test]
    fn test_tool_outcome_first_text() {
        let outcome = ToolOutcome {
            content: vec![
                ContentItem {
                    kind: "image".to_string(),
                    text: String::new(),
                },
                ContentItem {
                    kind: "text".to_string(),
                    text: "hello".to_string(),
                },
            ],
            structured: None,
            is_error: false,
        };
        assert_eq!(outcome.first_text(), "hello");
        assert_eq!(ToolOutcome::error("boom".into()).first_text(), "boom");
    }

    #[test]
    fn test_rate_limit_stats_delta() {
        let earlier = RateLimitStats {
            hits: 1,
            retries: 1,
            total_wait_ms: 100,
            retry_successes: 1,
        };
        let later = RateLimitStats {
            hits: 3,
            retries: 2,
            total_wait_ms: 350,
            retry_successes: 1,
        };
        let delta = later.delta_since(&earlier);
        assert_eq!(delta.hits, 2);
        assert_eq!(delta.retries, 1);
        assert_eq!(delta.total_wait_ms, 250);
        assert_eq!(delta.retry_successes, 0);
    }

    #[test]
    fn test_execution_record_serializes_camel_case() {
        let record = ExecutionRecord {
            test_name: "t".into(),
            agent_name: "a".into(),
            provider_type: "openai".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            messages: vec![],
            tool_calls: vec![],
            final_output: "done".into(),
            tokens_used: 1,
            latency_ms: 2,
            errors: vec![],
            rate_limit_stats: RateLimitStats::default(),
            clarification_stats: ClarificationStats::default(),
        };
        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "testName",
            "agentName",
            "providerType",
            "startTime",
            "endTime",
            "toolCalls",
            "finalOutput",
            "tokensUsed",
            "latencyMs",
            "rateLimitStats",
            "clarificationStats",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
