pub(crate) mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::ratelimit::RateLimitedBackend;
use crate::llm::LlmError;
use crate::mcp::ServerPool;

use self::types::{
    ChatMessage, ChatRequest, ClarificationStats, ExecutionRecord, Role, ToolCallIntent,
    ToolCallRecord, ToolDefinition, ToolOutcome, TraceMessage,
};

pub(crate) const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const JUDGE_TIMEOUT: Duration = Duration::from_secs(5);
const CLARIFICATION_EXAMPLE_CHARS: usize = 200;

/// How loudly a detected clarification is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClarificationLevel {
    Info,
    Warning,
    Error,
}

impl ClarificationLevel {
    pub fn parse(level: &str) -> Self {
        match level {
            "error" => Self::Error,
            "warning" => Self::Warning,
            _ => Self::Info,
        }
    }
}

pub(crate) struct ClarificationSettings {
    pub level: ClarificationLevel,
    /// The agent's own provider when configured as `$self`.
    pub judge: Arc<RateLimitedBackend>,
}

/// A named binding of one provider to a set of tool servers plus settings.
pub(crate) struct AgentHandle {
    pub name: String,
    pub backend: Arc<RateLimitedBackend>,
    /// Effective tool set after attachment whitelists.
    pub tools: Vec<ToolDefinition>,
    /// tool name -> server name; injective by construction.
    pub tool_map: HashMap<String, String>,
    pub max_iterations: u32,
    pub tool_timeout: Duration,
    pub verbose: bool,
    pub clarification: Option<ClarificationSettings>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle").field("name", &self.name).finish()
    }
}

impl AgentHandle {
    /// Tools visible in this session (session whitelist on top of the
    /// agent's own; empty whitelist means everything).
    fn session_tools(&self, session_allowed: &[String]) -> Vec<ToolDefinition> {
        if session_allowed.is_empty() {
            return self.tools.clone();
        }
        self.tools
            .iter()
            .filter(|t| session_allowed.iter().any(|a| a == &t.name))
            .cloned()
            .collect()
    }
}

/// Loop state; Done/Aborted/Failed are terminal.
enum LoopState {
    Generate,
    Dispatch(Vec<ToolCallIntent>),
    Done,
    Aborted,
    Failed,
}

/// Drive one test prompt through the LLM <-> tool loop and return the
/// completed execution record. Per-execution errors are collected, never
/// thrown; only the record reports them.
pub(crate) async fn run_test(
    cancel: &CancellationToken,
    agent: &AgentHandle,
    pool: &ServerPool,
    test_name: &str,
    prompt: &str,
    session_allowed: &[String],
) -> ExecutionRecord {
    let start_time = Utc::now();
    let started = std::time::Instant::now();
    let stats_before = agent.backend.stats();

    let tools = agent.session_tools(session_allowed);

    let mut chat_messages = vec![ChatMessage::user(prompt)];
    let mut trace = vec![TraceMessage {
        role: Role::User,
        content: prompt.to_string(),
        timestamp: Utc::now(),
    }];
    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut clarification_stats = ClarificationStats::default();
    let mut tokens_used: u64 = 0;
    let mut final_output = String::new();
    let mut last_assistant = String::new();

    let mut iteration: u32 = 0;
    let mut state = LoopState::Generate;

    loop {
        match state {
            LoopState::Generate => {
                if iteration >= agent.max_iterations {
                    errors.push(format!(
                        "maximum iterations reached ({})",
                        agent.max_iterations
                    ));
                    final_output = last_assistant.clone();
                    state = LoopState::Aborted;
                    continue;
                }
                iteration += 1;

                if agent.verbose {
                    tracing::info!(
                        agent = %agent.name,
                        test = %test_name,
                        iteration,
                        messages = chat_messages.len(),
                        tools = tools.len(),
                        "generating"
                    );
                }

                let request = ChatRequest {
                    messages: chat_messages.clone(),
                    tools: tools.clone(),
                    max_tokens: DEFAULT_MAX_TOKENS,
                    temperature: None,
                };

                let response = match agent.backend.chat(cancel, request).await {
                    Ok(response) => response,
                    Err(LlmError::Cancelled) => {
                        errors.push("execution cancelled".to_string());
                        final_output = last_assistant.clone();
                        state = LoopState::Failed;
                        continue;
                    }
                    Err(e) => {
                        errors.push(format!("LLM generation error: {e}"));
                        final_output = last_assistant.clone();
                        state = LoopState::Failed;
                        continue;
                    }
                };

                tokens_used += response.tokens.effective(&response.content);

                let intents: Vec<ToolCallIntent> = response
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(index, tc)| ToolCallIntent {
                        id: if tc.id.is_empty() {
                            format!("call_{iteration}_{index}")
                        } else {
                            tc.id.clone()
                        },
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    })
                    .collect();

                chat_messages.push(ChatMessage::assistant(
                    response.content.clone(),
                    intents.clone(),
                ));
                trace.push(TraceMessage {
                    role: Role::Assistant,
                    content: response.content.clone(),
                    timestamp: Utc::now(),
                });
                last_assistant = response.content.clone();

                if intents.is_empty() {
                    final_output = response.content;
                    if let Some(ref settings) = agent.clarification {
                        check_clarification(
                            settings,
                            cancel,
                            &final_output,
                            iteration,
                            &mut clarification_stats,
                            &mut errors,
                        )
                        .await;
                    }
                    state = LoopState::Done;
                } else {
                    state = LoopState::Dispatch(intents);
                }
            }

            LoopState::Dispatch(intents) => {
                let mut cancelled = false;

                for intent in &intents {
                    let params = match parse_arguments(&intent.arguments) {
                        Ok(params) => params,
                        Err(e) => {
                            errors.push(format!(
                                "invalid arguments for tool '{}': {e}",
                                intent.name
                            ));
                            let text = format!("Error: invalid tool arguments: {e}");
                            chat_messages.push(ChatMessage::tool(&intent.id, text.clone()));
                            trace.push(TraceMessage {
                                role: Role::Tool,
                                content: text,
                                timestamp: Utc::now(),
                            });
                            continue;
                        }
                    };

                    let dispatched_at = Utc::now();
                    let call_started = std::time::Instant::now();

                    let outcome = match agent.tool_map.get(&intent.name) {
                        None => {
                            errors.push(format!("tool not found: '{}'", intent.name));
                            ToolOutcome::error(format!("Error: tool not found: {}", intent.name))
                        }
                        Some(server) => {
                            tracing::debug!(tool = %intent.name, server = %server, "dispatching tool call");
                            let call = pool.call_tool(
                                server,
                                &intent.name,
                                Value::Object(params.clone()),
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    errors.push("execution cancelled".to_string());
                                    cancelled = true;
                                    ToolOutcome::error("Error: execution cancelled".to_string())
                                }
                                result = tokio::time::timeout(agent.tool_timeout, call) => {
                                    match result {
                                        Ok(Ok(outcome)) => outcome,
                                        Ok(Err(e)) => {
                                            errors.push(format!("tool '{}' failed: {e}", intent.name));
                                            ToolOutcome::error(format!("Error: {e}"))
                                        }
                                        Err(_) => {
                                            errors.push(format!(
                                                "tool '{}' timed out after {}ms",
                                                intent.name,
                                                agent.tool_timeout.as_millis()
                                            ));
                                            ToolOutcome::error(
                                                "Error: tool execution timed out".to_string(),
                                            )
                                        }
                                    }
                                }
                            }
                        }
                    };

                    let result_text = stringify_outcome(&outcome);
                    tool_calls.push(ToolCallRecord {
                        name: intent.name.clone(),
                        parameters: params,
                        timestamp: dispatched_at,
                        duration_ms: call_started.elapsed().as_millis() as u64,
                        result: outcome,
                    });
                    chat_messages.push(ChatMessage::tool(&intent.id, result_text.clone()));
                    trace.push(TraceMessage {
                        role: Role::Tool,
                        content: result_text,
                        timestamp: Utc::now(),
                    });

                    if cancelled {
                        break;
                    }
                }

                state = if cancelled {
                    final_output = last_assistant.clone();
                    LoopState::Failed
                } else {
                    LoopState::Generate
                };
            }

            LoopState::Done | LoopState::Aborted | LoopState::Failed => break,
        }
    }

    let end_time = Utc::now();
    ExecutionRecord {
        test_name: test_name.to_string(),
        agent_name: agent.name.clone(),
        provider_type: agent.backend.provider_kind().to_string(),
        start_time,
        end_time,
        messages: trace,
        tool_calls,
        final_output,
        tokens_used,
        latency_ms: started.elapsed().as_millis() as u64,
        errors,
        rate_limit_stats: agent.backend.stats().delta_since(&stats_before),
        clarification_stats,
    }
}

/// Parse a tool-call argument string into a JSON object. Empty input and
/// "{}" mean no arguments; anything that is not an object is rejected.
fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "{}" || trimmed == "null" {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        )),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The text a tool result contributes back to the conversation.
fn stringify_outcome(outcome: &ToolOutcome) -> String {
    let text = outcome.first_text();
    if !text.is_empty() {
        return text.to_string();
    }
    match &outcome.structured {
        Some(value) => value.to_string(),
        None => String::new(),
    }
}

/// Ask the judge whether the final turn is a clarification request. Judge
/// failures and timeouts default to "no"; judge tokens are not charged.
async fn check_clarification(
    settings: &ClarificationSettings,
    cancel: &CancellationToken,
    final_output: &str,
    iteration: u32,
    stats: &mut ClarificationStats,
    errors: &mut Vec<String>,
) {
    if final_output.trim().is_empty() {
        return;
    }

    let prompt = format!(
        "You are judging another assistant's final reply. Answer YES if the \
         reply asks the user a question or requests confirmation instead of \
         completing the task. Answer NO otherwise. Reply with YES or NO only.\n\n\
         Reply to judge:\n{final_output}"
    );
    let request = ChatRequest {
        messages: vec![ChatMessage::user(&prompt)],
        tools: vec![],
        max_tokens: 16,
        temperature: None,
    };

    let verdict = match tokio::time::timeout(JUDGE_TIMEOUT, settings.judge.chat(cancel, request))
        .await
    {
        Ok(Ok(response)) => response.content.trim().to_lowercase().starts_with("yes"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "clarification judge failed, skipping");
            false
        }
        Err(_) => {
            tracing::warn!("clarification judge timed out, skipping");
            false
        }
    };

    if !verdict {
        return;
    }

    let example = truncate_example(final_output);
    stats.count += 1;
    stats.iterations.push(iteration);
    stats.examples.push(example.clone());

    match settings.level {
        ClarificationLevel::Info => {
            tracing::info!(example = %example, "clarification detected");
        }
        ClarificationLevel::Warning | ClarificationLevel::Error => {
            errors.push(format!("LLM asked for clarification: {example}"));
        }
    }
}

fn truncate_example(s: &str) -> String {
    if s.chars().count() <= CLARIFICATION_EXAMPLE_CHARS {
        return s.to_string();
    }
    s.chars().take(CLARIFICATION_EXAMPLE_CHARS).collect()
}
