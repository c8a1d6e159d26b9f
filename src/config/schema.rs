use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::assertions::AssertionSpec;
use crate::extract::ExtractorSpec;

/// A single benchmark file: providers, servers, agents, and the sessions to
/// drive through them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TestConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub sessions: Vec<SessionConfig>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub criteria: Criteria,
}

/// A suite: shared providers/servers/agents plus a list of test files, each
/// of which carries its own sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SuiteConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub criteria: Criteria,

    #[serde(default)]
    pub test_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProviderConfig {
    pub name: String,

    /// Provider kind: OPENAI, AZURE, ANTHROPIC, AMAZON-ANTHROPIC, GOOGLE,
    /// VERTEX, GROQ (case-insensitive).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub secret: Option<String>,

    pub model: String,

    #[serde(rename = "baseUrl", default)]
    pub base_url: Option<String>,

    /// API version (Azure).
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub credentials_path: Option<String>,

    /// "api_key" (default) or "entra_id" (Azure only).
    #[serde(default)]
    pub auth_type: Option<String>,

    #[serde(default)]
    pub rate_limits: Option<RateLimitsConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct RateLimitsConfig {
    /// Tokens per minute; 0 disables the TPM bucket.
    #[serde(default)]
    pub tpm: u64,

    /// Requests per minute; 0 disables the RPM bucket.
    #[serde(default)]
    pub rpm: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct RetryConfig {
    #[serde(default = "default_retry_on_429")]
    pub retry_on_429: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on_429: default_retry_on_429(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServerConfig {
    pub name: String,

    /// Transport kind: "stdio", "sse", "http", "cli".
    #[serde(rename = "type")]
    pub kind: String,

    /// Command line for stdio and cli servers.
    #[serde(default)]
    pub command: Option<String>,

    /// Endpoint for sse and http servers.
    #[serde(default)]
    pub url: Option<String>,

    /// "Key: Value" header strings for sse and http servers.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Delay before the first tools/list (duration string).
    #[serde(default)]
    pub server_delay: Option<String>,

    /// Delay between process spawn and the first request (duration string).
    #[serde(default)]
    pub process_delay: Option<String>,

    /// cli servers: shell override (defaults to the OS shell).
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// cli servers: prefix of the single `{prefix}_execute` tool.
    #[serde(default)]
    pub tool_prefix: Option<String>,

    /// cli servers: command whose output becomes the tool description.
    #[serde(default)]
    pub help_command: Option<String>,

    #[serde(default)]
    pub disable_help_auto_discovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentConfig {
    pub name: String,

    /// Name of the provider this agent speaks through.
    pub provider: String,

    #[serde(default)]
    pub servers: Vec<ServerAttachment>,

    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// Per-call tool deadline (duration string).
    #[serde(default)]
    pub tool_timeout: Option<String>,

    #[serde(default)]
    pub verbose: Option<bool>,

    #[serde(default)]
    pub clarification_detection: Option<ClarificationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServerAttachment {
    pub name: String,

    /// Whitelist of tool names; empty means every tool the server exposes.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClarificationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "info", "warning", or "error".
    #[serde(default = "default_clarification_level")]
    pub level: String,

    /// Provider name for the judge, or "$self" for the agent's own.
    #[serde(default = "default_judge_provider")]
    pub judge_provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionConfig {
    pub name: String,

    #[serde(default)]
    pub tests: Vec<TestSpec>,

    /// Session-wide tool whitelist applied on top of agent attachments.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TestSpec {
    pub name: String,

    /// Agent to run this test on; omitted means every configured agent.
    #[serde(default)]
    pub agent: Option<String>,

    pub prompt: String,

    /// Delay before this test starts (duration string); falls back to the
    /// global `test_delay`.
    #[serde(default)]
    pub start_delay: Option<String>,

    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,

    #[serde(default)]
    pub extractors: Vec<ExtractorSpec>,

    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Settings {
    #[serde(default)]
    pub verbose: bool,

    /// Default per-call tool deadline (duration string).
    #[serde(default)]
    pub tool_timeout: Option<String>,

    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// Default delay between successive tests in one (agent, session) lane.
    #[serde(default)]
    pub test_delay: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Criteria {
    /// Overall pass criterion, e.g. "80%". Missing means 100%.
    #[serde(default)]
    pub success_rate: Option<String>,
}

fn default_retry_on_429() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_clarification_level() -> String {
    "info".to_string()
}

fn default_judge_provider() -> String {
    "$self".to_string()
}

impl TestConfig {
    /// Validate startup-fatal conditions: duplicate names, dangling
    /// references, unknown kinds. Runs after template expansion.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_unique("provider", self.providers.iter().map(|p| p.name.as_str()))?;
        check_unique("server", self.servers.iter().map(|s| s.name.as_str()))?;
        check_unique("agent", self.agents.iter().map(|a| a.name.as_str()))?;
        check_unique("session", self.sessions.iter().map(|s| s.name.as_str()))?;

        for provider in &self.providers {
            if provider.model.is_empty() {
                anyhow::bail!("provider '{}' has no model", provider.name);
            }
            let kind = provider.kind.to_uppercase();
            let known = [
                "OPENAI",
                "AZURE",
                "ANTHROPIC",
                "AMAZON-ANTHROPIC",
                "GOOGLE",
                "VERTEX",
                "GROQ",
            ];
            if !known.contains(&kind.as_str()) {
                anyhow::bail!(
                    "provider '{}' has unknown type '{}', expected one of: {}",
                    provider.name,
                    provider.kind,
                    known.join(", ")
                );
            }
        }

        for server in &self.servers {
            match server.kind.as_str() {
                "stdio" | "cli" => {
                    if server.command.as_deref().unwrap_or("").is_empty() {
                        anyhow::bail!(
                            "server '{}' ({}) requires a command",
                            server.name,
                            server.kind
                        );
                    }
                }
                "sse" | "http" => {
                    if server.url.as_deref().unwrap_or("").is_empty() {
                        anyhow::bail!("server '{}' ({}) requires a url", server.name, server.kind);
                    }
                }
                other => {
                    anyhow::bail!(
                        "server '{}' has unknown type '{}', expected one of: stdio, sse, http, cli",
                        server.name,
                        other
                    );
                }
            }
        }

        for agent in &self.agents {
            if !self.providers.iter().any(|p| p.name == agent.provider) {
                anyhow::bail!(
                    "agent '{}' references unknown provider '{}'",
                    agent.name,
                    agent.provider
                );
            }
            for attachment in &agent.servers {
                if !self.servers.iter().any(|s| s.name == attachment.name) {
                    anyhow::bail!(
                        "agent '{}' references unknown server '{}'",
                        agent.name,
                        attachment.name
                    );
                }
            }
            if let Some(ref clarification) = agent.clarification_detection {
                let valid = ["info", "warning", "error"];
                if !valid.contains(&clarification.level.as_str()) {
                    anyhow::bail!(
                        "agent '{}': unknown clarification level '{}', expected one of: {}",
                        agent.name,
                        clarification.level,
                        valid.join(", ")
                    );
                }
                if clarification.judge_provider != "$self"
                    && !self
                        .providers
                        .iter()
                        .any(|p| p.name == clarification.judge_provider)
                {
                    anyhow::bail!(
                        "agent '{}': clarification judge references unknown provider '{}'",
                        agent.name,
                        clarification.judge_provider
                    );
                }
            }
        }

        for session in &self.sessions {
            for test in &session.tests {
                if let Some(ref agent) = test.agent {
                    if !agent.is_empty() && !self.agents.iter().any(|a| &a.name == agent) {
                        anyhow::bail!("test '{}' references unknown agent '{}'", test.name, agent);
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            anyhow::bail!("duplicate {kind} name '{name}'");
        }
    }
    Ok(())
}
