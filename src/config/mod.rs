pub(crate) mod schema;

pub(crate) use schema::{
    AgentConfig, ClarificationConfig, ProviderConfig, ServerConfig, SessionConfig, Settings,
    SuiteConfig, TestConfig, TestSpec,
};

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::template::TemplateContext;

/// Load a test config file: parse YAML, layer its `variables` into the
/// context, expand every string field, then validate.
pub(crate) fn load_test_config(path: &Path, ctx: &mut TemplateContext) -> Result<TestConfig> {
    let parsed = parse_test_file(path)?;
    finish_test_config(parsed, path, ctx)
}

/// Load one file of a suite: suite-level providers/servers/agents/settings
/// fill anything the file omits before expansion and validation.
pub(crate) fn load_suite_test_config(
    path: &Path,
    ctx: &mut TemplateContext,
    suite: &SuiteConfig,
) -> Result<TestConfig> {
    let mut parsed = parse_test_file(path)?;
    merge_suite_defaults(&mut parsed, suite);
    finish_test_config(parsed, path, ctx)
}

fn parse_test_file(path: &Path) -> Result<TestConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config from {}", path.display()))
}

fn finish_test_config(
    parsed: TestConfig,
    path: &Path,
    ctx: &mut TemplateContext,
) -> Result<TestConfig> {
    if let Some(dir) = path.parent().and_then(|d| d.to_str()) {
        ctx.set_test_dir(dir);
    }
    for (k, v) in &parsed.variables {
        ctx.set(k, &ctx.render(v));
    }

    let config = render_config(parsed, ctx)?;
    config.validate()?;
    Ok(config)
}

/// Load a suite config file (template-expanded the same way).
pub(crate) fn load_suite_config(path: &Path, ctx: &mut TemplateContext) -> Result<SuiteConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading suite config from {}", path.display()))?;
    let suite: SuiteConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing suite config from {}", path.display()))?;
    for (k, v) in &suite.variables {
        ctx.set(k, &ctx.render(v));
    }
    if suite.test_files.is_empty() {
        anyhow::bail!("suite config {} lists no test_files", path.display());
    }
    Ok(suite)
}

/// Fill a test file's omitted sections from the suite level (the file wins
/// where it specifies its own).
pub(crate) fn merge_suite_defaults(config: &mut TestConfig, suite: &SuiteConfig) {
    if config.providers.is_empty() {
        config.providers = suite.providers.clone();
    }
    if config.servers.is_empty() {
        config.servers = suite.servers.clone();
    }
    if config.agents.is_empty() {
        config.agents = suite.agents.clone();
    }
    if config.settings.tool_timeout.is_none() {
        config.settings.tool_timeout = suite.settings.tool_timeout.clone();
    }
    if config.settings.max_iterations.is_none() {
        config.settings.max_iterations = suite.settings.max_iterations;
    }
    if config.settings.test_delay.is_none() {
        config.settings.test_delay = suite.settings.test_delay.clone();
    }
    config.settings.verbose |= suite.settings.verbose;
    if config.criteria.success_rate.is_none() {
        config.criteria.success_rate = suite.criteria.success_rate.clone();
    }
    for (k, v) in &suite.variables {
        config.variables.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Expand {{...}} placeholders in every string field of the config by
/// round-tripping through a JSON value tree.
fn render_config(config: TestConfig, ctx: &TemplateContext) -> Result<TestConfig> {
    let mut value = serde_json::to_value(&config).context("serializing config for expansion")?;
    render_value(&mut value, ctx);
    serde_json::from_value(value).context("rebuilding config after expansion")
}

fn render_value(value: &mut Value, ctx: &TemplateContext) {
    match value {
        Value::String(s) => {
            if s.contains("{{") {
                *s = ctx.render(s);
            }
        }
        Value::Array(items) => {
            for item in items {
                render_value(item, ctx);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                render_value(v, ctx);
            }
        }
        _ => {}
    }
}

/// Parse a duration string: `ms`, `s`, `m`, `h` suffixes, compositions like
/// "1h30m45s", or a bare number meaning seconds. Empty or unparsable input
/// yields None (caller substitutes the default); negatives clamp to zero.
pub(crate) fn parse_duration(input: &str) -> Option<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix('-') {
        // Negative durations clamp to zero (but stay None when unparsable).
        return parse_duration(rest).map(|_| Duration::ZERO);
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = trimmed.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else {
            match c {
                's' => "s",
                'm' => "m",
                'h' => "h",
                _ => return None,
            }
        };
        let amount: f64 = number.parse().ok()?;
        number.clear();
        total += match unit {
            "ms" => Duration::from_secs_f64(amount / 1000.0),
            "s" => Duration::from_secs_f64(amount),
            "m" => Duration::from_secs_f64(amount * 60.0),
            "h" => Duration::from_secs_f64(amount * 3600.0),
            _ => unreachable!(),
        };
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}

/// Duration from an optional config string, falling back to `default`.
pub(crate) fn duration_or(input: Option<&str>, default: Duration) -> Duration {
    input.and_then(parse_duration).unwrap_or(default)
}

/// Parse a success-rate criterion like "80%" or "80" into a fraction.
pub(crate) fn parse_success_rate(input: Option<&str>) -> f64 {
    let raw = match input {
        Some(s) if !s.trim().is_empty() => s.trim().trim_end_matches('%'),
        _ => return 1.0,
    };
    match raw.trim().parse::<f64>() {
        Ok(pct) => (pct / 100.0).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// Resolve a provider token: explicit config value wins, otherwise fall back
/// to the conventional environment variable for the provider kind.
pub(crate) fn resolve_provider_token(provider: &ProviderConfig) -> Option<String> {
    if let Some(token) = provider.token.as_deref() {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let env_var = match provider.kind.to_uppercase().as_str() {
        "ANTHROPIC" | "AMAZON-ANTHROPIC" => "ANTHROPIC_API_KEY",
        "AZURE" => "AZURE_OPENAI_API_KEY",
        "GOOGLE" | "VERTEX" => "GOOGLE_API_KEY",
        "GROQ" => "GROQ_API_KEY",
        _ => "OPENAI_API_KEY",
    };
    match std::env::var(env_var) {
        Ok(val) if !val.is_empty() => Some(val),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_duration_composition() {
        assert_eq!(
            parse_duration("1h30m45s"),
            Some(Duration::from_secs(3600 + 1800 + 45))
        );
        assert_eq!(
            parse_duration("1m500ms"),
            Some(Duration::from_millis(60_500))
        );
    }

    #[test]
    fn test_parse_duration_bare_number_is_seconds() {
        assert_eq!(parse_duration("5"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_duration_empty_and_invalid() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("  "), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("5s3"), None);
    }

    #[test]
    fn test_parse_duration_negative_is_zero() {
        assert_eq!(parse_duration("-3s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("-5"), Some(Duration::ZERO));
    }

    #[test]
    fn test_duration_or_fallback() {
        let default = Duration::from_secs(30);
        assert_eq!(duration_or(None, default), default);
        assert_eq!(duration_or(Some("bogus"), default), default);
        assert_eq!(duration_or(Some("1s"), default), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_success_rate() {
        assert!((parse_success_rate(Some("80%")) - 0.8).abs() < 1e-9);
        assert!((parse_success_rate(Some("100%")) - 1.0).abs() < 1e-9);
        assert!((parse_success_rate(None) - 1.0).abs() < 1e-9);
        assert!((parse_success_rate(Some("junk")) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_config_expands_strings() {
        let mut vars = HashMap::new();
        vars.insert("MODEL".to_string(), "gpt-4o".to_string());
        let ctx = TemplateContext::new(1, &vars);

        let yaml = r#"
providers:
  - name: main
    type: OPENAI
    model: "{{MODEL}}"
"#;
        let parsed: TestConfig = serde_yaml::from_str(yaml).unwrap();
        let rendered = render_config(parsed, &ctx).unwrap();
        assert_eq!(rendered.providers[0].model, "gpt-4o");
    }

    #[test]
    fn test_render_config_leaves_unknown_placeholders() {
        let ctx = TemplateContext::new(1, &HashMap::new());
        let yaml = r#"
sessions:
  - name: s
    tests:
      - name: t
        prompt: "find {{ITEM_ID}}"
"#;
        let parsed: TestConfig = serde_yaml::from_str(yaml).unwrap();
        let rendered = render_config(parsed, &ctx).unwrap();
        // Extractor variables do not exist yet at load time.
        assert_eq!(rendered.sessions[0].tests[0].prompt, "find {{ITEM_ID}}");
    }

    #[test]
    fn test_load_test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        std::fs::write(
            &path,
            r#"
variables:
  TARGET: /tmp/out.txt
providers:
  - name: main
    type: ANTHROPIC
    model: claude-sonnet-4
sessions:
  - name: s
    tests:
      - name: t
        prompt: "write {{TARGET}}"
"#,
        )
        .unwrap();

        let mut ctx = TemplateContext::new(1, &HashMap::new());
        let config = load_test_config(&path, &mut ctx).unwrap();
        assert_eq!(config.sessions[0].tests[0].prompt, "write /tmp/out.txt");
        assert_eq!(ctx.get("TEST_DIR"), dir.path().to_str());
    }

    #[test]
    fn test_merge_suite_defaults() {
        let suite: SuiteConfig = serde_yaml::from_str(
            r#"
providers:
  - name: shared
    type: OPENAI
    model: gpt-4o
settings:
  test_delay: 2s
criteria:
  success_rate: "80%"
test_files: [a.yaml]
"#,
        )
        .unwrap();
        let mut config: TestConfig = serde_yaml::from_str("{}").unwrap();
        merge_suite_defaults(&mut config, &suite);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.settings.test_delay.as_deref(), Some("2s"));
        assert_eq!(config.criteria.success_rate.as_deref(), Some("80%"));
    }
}
