// Execution planner: build providers, servers, and agents at startup
// (fail-atomic), then drive the (session x test x agent) cross product
// serially, feeding extractor output forward through each session's
// template context.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::types::ExecutionRecord;
use crate::agent::{
    run_test, AgentHandle, ClarificationLevel, ClarificationSettings, DEFAULT_MAX_ITERATIONS,
};
use crate::assertions::{evaluate, AssertionResult};
use crate::config::{duration_or, AgentConfig, Settings, TestConfig};
use crate::extract::run_extractors;
use crate::llm::ratelimit::RateLimitedBackend;
use crate::llm::create_backend;
use crate::mcp::ServerPool;
use crate::template::TemplateContext;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// One scheduled execution's outcome: the record plus its judged assertions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunOutcome {
    pub session_name: String,
    pub passed: bool,
    pub assertions: Vec<AssertionResult>,
    pub execution: ExecutionRecord,
}

/// Everything a run produced, in scheduling order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RunResults {
    pub outcomes: Vec<RunOutcome>,
}

impl RunResults {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn pass_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        self.passed() as f64 / self.total() as f64
    }

    pub fn meets(&self, success_rate: f64) -> bool {
        self.pass_rate() >= success_rate
    }

    /// (passed, total) per agent name.
    pub fn by_agent(&self) -> BTreeMap<String, (usize, usize)> {
        let mut map: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for outcome in &self.outcomes {
            let entry = map.entry(outcome.execution.agent_name.clone()).or_default();
            entry.1 += 1;
            if outcome.passed {
                entry.0 += 1;
            }
        }
        map
    }

    /// (passed, total) per test name, across agents.
    pub fn by_test(&self) -> BTreeMap<String, (usize, usize)> {
        let mut map: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for outcome in &self.outcomes {
            let entry = map.entry(outcome.execution.test_name.clone()).or_default();
            entry.1 += 1;
            if outcome.passed {
                entry.0 += 1;
            }
        }
        map
    }

    pub fn merge(&mut self, other: RunResults) {
        self.outcomes.extend(other.outcomes);
    }
}

pub(crate) struct Planner {
    pool: ServerPool,
    agents: Vec<AgentHandle>,
    config: TestConfig,
    test_delay: Duration,
}

impl Planner {
    /// Construct every provider, server, and agent. Any failure here is
    /// fatal and leaves nothing running.
    pub async fn build(config: TestConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<RateLimitedBackend>> = HashMap::new();
        for provider in &config.providers {
            let backend = create_backend(provider)
                .with_context(|| format!("creating provider '{}'", provider.name))?;
            providers.insert(
                provider.name.clone(),
                Arc::new(RateLimitedBackend::new(provider, backend)),
            );
        }

        let pool = ServerPool::build(&config.servers).await?;

        let agents =
            match build_agents(&config.agents, &config.settings, &providers, &pool).await {
                Ok(agents) => agents,
                Err(e) => {
                    pool.close_all().await;
                    return Err(e);
                }
            };

        let test_delay = duration_or(config.settings.test_delay.as_deref(), Duration::ZERO);
        Ok(Self {
            pool,
            agents,
            config,
            test_delay,
        })
    }

    #[cfg(test)]
    fn from_parts(pool: ServerPool, agents: Vec<AgentHandle>, config: TestConfig) -> Self {
        let test_delay = duration_or(config.settings.test_delay.as_deref(), Duration::ZERO);
        Self {
            pool,
            agents,
            config,
            test_delay,
        }
    }

    /// Run the whole cross product. Individual execution failures are
    /// captured in their records; only cancellation stops the schedule.
    pub async fn execute(&self, cancel: &CancellationToken, base_ctx: &TemplateContext) -> RunResults {
        let mut results = RunResults::default();

        'sessions: for session in &self.config.sessions {
            let mut session_ctx = base_ctx.clone();
            let mut lanes_started: HashSet<String> = HashSet::new();

            for test in &session.tests {
                let eligible: Vec<&AgentHandle> = match test.agent.as_deref() {
                    Some(name) if !name.is_empty() => {
                        self.agents.iter().filter(|a| a.name == name).collect()
                    }
                    _ => self.agents.iter().collect(),
                };

                for agent in eligible {
                    if cancel.is_cancelled() {
                        tracing::info!("run cancelled, stopping the schedule");
                        break 'sessions;
                    }

                    if lanes_started.contains(&agent.name) {
                        let delay = duration_or(test.start_delay.as_deref(), self.test_delay);
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => break 'sessions,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                    lanes_started.insert(agent.name.clone());

                    let test_ctx = session_ctx.with_vars(&test.variables);
                    let prompt = test_ctx.render(&test.prompt);

                    tracing::info!(
                        session = %session.name,
                        test = %test.name,
                        agent = %agent.name,
                        "running test"
                    );
                    let record = run_test(
                        cancel,
                        agent,
                        &self.pool,
                        &test.name,
                        &prompt,
                        &session.allowed_tools,
                    )
                    .await;

                    run_extractors(&test.extractors, &record, &mut session_ctx);

                    let eval_ctx = session_ctx.with_vars(&test.variables);
                    let known: HashSet<String> = agent.tool_map.keys().cloned().collect();
                    let assertions: Vec<AssertionResult> = test
                        .assertions
                        .iter()
                        .map(|a| evaluate(a, &record, &known, &eval_ctx))
                        .collect();
                    let passed = assertions.iter().all(|r| r.passed);

                    tracing::info!(
                        test = %test.name,
                        agent = %agent.name,
                        passed,
                        errors = record.errors.len(),
                        "test finished"
                    );
                    results.outcomes.push(RunOutcome {
                        session_name: session.name.clone(),
                        passed,
                        assertions,
                        execution: record,
                    });
                }
            }
        }

        results
    }

    /// Release every server. Call exactly once when the run is over.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}

/// Resolve agent configs into handles: list each attached server's tools,
/// apply the attachment whitelist, and build the injective tool -> server
/// map (a collision is a startup error).
async fn build_agents(
    configs: &[AgentConfig],
    settings: &Settings,
    providers: &HashMap<String, Arc<RateLimitedBackend>>,
    pool: &ServerPool,
) -> Result<Vec<AgentHandle>> {
    let mut agents = Vec::new();

    for config in configs {
        let backend = providers
            .get(&config.provider)
            .with_context(|| {
                format!(
                    "agent '{}' references unknown provider '{}'",
                    config.name, config.provider
                )
            })?
            .clone();

        let mut tools = Vec::new();
        let mut tool_map: HashMap<String, String> = HashMap::new();

        for attachment in &config.servers {
            let server = pool.get(&attachment.name).with_context(|| {
                format!(
                    "agent '{}' references unknown server '{}'",
                    config.name, attachment.name
                )
            })?;
            let listed = server
                .list_tools()
                .await
                .with_context(|| format!("listing tools of server '{}'", attachment.name))?;

            for tool in listed {
                if !attachment.allowed_tools.is_empty()
                    && !attachment.allowed_tools.iter().any(|a| a == &tool.name)
                {
                    continue;
                }
                if let Some(existing) = tool_map.get(&tool.name) {
                    anyhow::bail!(
                        "agent '{}': tool '{}' is provided by both '{}' and '{}'",
                        config.name,
                        tool.name,
                        existing,
                        attachment.name
                    );
                }
                tool_map.insert(tool.name.clone(), attachment.name.clone());
                tools.push(tool);
            }
        }

        let clarification = config
            .clarification_detection
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| -> Result<ClarificationSettings> {
                let judge = if c.judge_provider == "$self" {
                    backend.clone()
                } else {
                    providers
                        .get(&c.judge_provider)
                        .with_context(|| {
                            format!(
                                "agent '{}': judge references unknown provider '{}'",
                                config.name, c.judge_provider
                            )
                        })?
                        .clone()
                };
                Ok(ClarificationSettings {
                    level: ClarificationLevel::parse(&c.level),
                    judge,
                })
            })
            .transpose()?;

        agents.push(AgentHandle {
            name: config.name.clone(),
            backend,
            tools,
            tool_map,
            max_iterations: config
                .max_iterations
                .or(settings.max_iterations)
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            tool_timeout: config
                .tool_timeout
                .as_deref()
                .and_then(crate::config::parse_duration)
                .unwrap_or_else(|| {
                    duration_or(settings.tool_timeout.as_deref(), DEFAULT_TOOL_TIMEOUT)
                }),
            verbose: config.verbose.unwrap_or(settings.verbose),
            clarification,
        });
    }

    Ok(agents)
}
