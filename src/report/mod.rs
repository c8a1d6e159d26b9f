// Report generation: aggregate run results into a plain data structure and
// render it as JSON, Markdown, or HTML.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::planner::{RunOutcome, RunResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportKind {
    Html,
    Json,
    Markdown,
}

impl ReportKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            "md" | "markdown" => Ok(Self::Markdown),
            other => anyhow::bail!("unknown report type '{other}', expected html, json, or md"),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: String,
    pub total_tokens: u64,
    pub avg_latency_ms: u64,
}

/// The complete report artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Report {
    pub agent_benchmark_version: String,
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub comparison_summary: BTreeMap<String, AgentSummary>,
    pub detailed_results: Vec<RunOutcome>,
}

impl Report {
    pub fn from_results(results: &RunResults) -> Self {
        let total = results.total();
        let passed = results.passed();

        let mut comparison: BTreeMap<String, AgentSummary> = BTreeMap::new();
        for (agent, (agent_passed, agent_total)) in results.by_agent() {
            let outcomes: Vec<&RunOutcome> = results
                .outcomes
                .iter()
                .filter(|o| o.execution.agent_name == agent)
                .collect();
            let total_tokens: u64 = outcomes.iter().map(|o| o.execution.tokens_used).sum();
            let avg_latency_ms = if outcomes.is_empty() {
                0
            } else {
                outcomes.iter().map(|o| o.execution.latency_ms).sum::<u64>()
                    / outcomes.len() as u64
            };
            comparison.insert(
                agent,
                AgentSummary {
                    total: agent_total,
                    passed: agent_passed,
                    failed: agent_total - agent_passed,
                    pass_rate: percent(agent_passed, agent_total),
                    total_tokens,
                    avg_latency_ms,
                },
            );
        }

        Self {
            agent_benchmark_version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
            summary: Summary {
                total,
                passed,
                failed: total - passed,
            },
            comparison_summary: comparison,
            detailed_results: results.outcomes.clone(),
        }
    }

    pub fn render(&self, kind: ReportKind) -> Result<String> {
        match kind {
            ReportKind::Json => self.to_json(),
            ReportKind::Markdown => Ok(self.to_markdown()),
            ReportKind::Html => Ok(self.to_html()),
        }
    }

    pub fn write(&self, path: &Path, kind: ReportKind) -> Result<()> {
        let rendered = self.render(kind)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating report directory {}", dir.display()))?;
        }
        std::fs::write(path, rendered)
            .with_context(|| format!("writing report to {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing report")
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Agent Benchmark Report\n\n");
        out.push_str(&format!(
            "Generated: {}\n\n",
            self.generated_at.to_rfc3339()
        ));
        out.push_str(&format!(
            "**{} passed / {} failed / {} total**\n\n",
            self.summary.passed, self.summary.failed, self.summary.total
        ));

        out.push_str("## Agents\n\n");
        out.push_str("| Agent | Passed | Failed | Pass rate | Tokens | Avg latency (ms) |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for (agent, summary) in &self.comparison_summary {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                agent,
                summary.passed,
                summary.failed,
                summary.pass_rate,
                summary.total_tokens,
                summary.avg_latency_ms
            ));
        }

        out.push_str("\n## Results\n\n");
        for outcome in &self.detailed_results {
            let status = if outcome.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "### [{}] {} / {} ({})\n\n",
                status,
                outcome.session_name,
                outcome.execution.test_name,
                outcome.execution.agent_name
            ));
            out.push_str(&format!(
                "- tokens: {}, latency: {}ms, tool calls: {}\n",
                outcome.execution.tokens_used,
                outcome.execution.latency_ms,
                outcome.execution.tool_calls.len()
            ));
            for assertion in &outcome.assertions {
                let mark = if assertion.passed { "x" } else { " " };
                out.push_str(&format!(
                    "- [{}] `{}`: {}\n",
                    mark, assertion.kind, assertion.message
                ));
            }
            for error in &outcome.execution.errors {
                out.push_str(&format!("- error: {error}\n"));
            }
            out.push('\n');
        }

        out
    }

    pub fn to_html(&self) -> String {
        let mut rows = String::new();
        for (agent, summary) in &self.comparison_summary {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(agent),
                summary.passed,
                summary.failed,
                summary.pass_rate,
                summary.total_tokens,
                summary.avg_latency_ms
            ));
        }

        let mut details = String::new();
        for outcome in &self.detailed_results {
            let class = if outcome.passed { "pass" } else { "fail" };
            details.push_str(&format!(
                "<div class=\"result {}\"><h3>{} / {} ({})</h3><p>{} tokens, {}ms</p><ul>\n",
                class,
                escape(&outcome.session_name),
                escape(&outcome.execution.test_name),
                escape(&outcome.execution.agent_name),
                outcome.execution.tokens_used,
                outcome.execution.latency_ms
            ));
            for assertion in &outcome.assertions {
                details.push_str(&format!(
                    "<li class=\"{}\">{}: {}</li>\n",
                    if assertion.passed { "pass" } else { "fail" },
                    escape(&assertion.kind),
                    escape(&assertion.message)
                ));
            }
            for error in &outcome.execution.errors {
                details.push_str(&format!("<li class=\"error\">{}</li>\n", escape(error)));
            }
            details.push_str("</ul></div>\n");
        }

        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
             <title>Agent Benchmark Report</title>\
             <style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse}}\
             td,th{{border:1px solid #ccc;padding:4px 8px}}\
             .pass{{color:#16803c}}.fail{{color:#b91c1c}}.error{{color:#b45309}}</style>\
             </head><body>\n<h1>Agent Benchmark Report</h1>\n\
             <p>Generated {generated}</p>\n\
             <p><strong>{passed} passed / {failed} failed / {total} total</strong></p>\n\
             <table><tr><th>Agent</th><th>Passed</th><th>Failed</th><th>Pass rate</th>\
             <th>Tokens</th><th>Avg latency (ms)</th></tr>\n{rows}</table>\n{details}\
             </body></html>\n",
            generated = self.generated_at.to_rfc3339(),
            passed = self.summary.passed,
            failed = self.summary.failed,
            total = self.summary.total,
        )
    }
}

fn percent(part: usize, whole: usize) -> String {
    if whole == 0 {
        return "100.0%".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / whole as f64)
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::{
        ClarificationStats, ExecutionRecord, RateLimitStats,
    };
    use crate::assertions::AssertionResult;

    fn results() -> RunResults {
        let mut results = RunResults::default();
        for (agent, test, passed) in [("fast", "t1", true), ("fast", "t2", false), ("slow", "t1", true)]
        {
            results.outcomes.push(RunOutcome {
                session_name: "smoke".into(),
                passed,
                assertions: vec![AssertionResult {
                    kind: "tool_called".into(),
                    passed,
                    message: "tool 'x' was called".into(),
                    details: None,
                }],
                execution: ExecutionRecord {
                    test_name: test.into(),
                    agent_name: agent.into(),
                    provider_type: "openai".into(),
                    start_time: Utc::now(),
                    end_time: Utc::now(),
                    messages: vec![],
                    tool_calls: vec![],
                    final_output: "Done".into(),
                    tokens_used: 100,
                    latency_ms: 250,
                    errors: if passed { vec![] } else { vec!["boom".into()] },
                    rate_limit_stats: RateLimitStats::default(),
                    clarification_stats: ClarificationStats::default(),
                },
            });
        }
        results
    }

    #[test]
    fn test_summary_counts() {
        let report = Report::from_results(&results());
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.comparison_summary["fast"].pass_rate, "50.0%");
        assert_eq!(report.comparison_summary["fast"].total_tokens, 200);
        assert_eq!(report.comparison_summary["slow"].avg_latency_ms, 250);
    }

    #[test]
    fn test_json_schema_keys() {
        let report = Report::from_results(&results());
        let json: serde_json::Value =
            serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert!(json.get("agent_benchmark_version").is_some());
        assert!(json.get("generated_at").is_some());
        assert!(json.get("summary").is_some());
        assert!(json.get("comparison_summary").is_some());
        let detail = &json["detailed_results"][0];
        let execution = &detail["execution"];
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
            "errors",
            "rateLimitStats",
            "clarificationStats",
        ] {
            assert!(execution.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_markdown_rendering() {
        let md = Report::from_results(&results()).to_markdown();
        assert!(md.contains("# Agent Benchmark Report"));
        assert!(md.contains("| fast |"));
        assert!(md.contains("[FAIL]"));
        assert!(md.contains("error: boom"));
    }

    #[test]
    fn test_html_rendering_escapes() {
        let mut r = results();
        r.outcomes[0].execution.errors.push("<script>".into());
        let html = Report::from_results(&r).to_html();
        assert!(html.contains("<table>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        Report::from_results(&results())
            .write(&path, ReportKind::Json)
            .unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("detailed_results"));
    }

    #[test]
    fn test_report_kind_parse() {
        assert_eq!(ReportKind::parse("html").unwrap(), ReportKind::Html);
        assert_eq!(ReportKind::parse("JSON").unwrap(), ReportKind::Json);
        assert_eq!(ReportKind::parse("md").unwrap(), ReportKind::Markdown);
        assert_eq!(ReportKind::parse("markdown").unwrap(), ReportKind::Markdown);
        assert!(ReportKind::parse("pdf").is_err());
        assert_eq!(ReportKind::Markdown.extension(), "md");
    }
}
