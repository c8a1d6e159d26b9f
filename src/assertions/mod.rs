// Assertion evaluator: leaf predicates over a completed execution record
// plus anyOf/allOf/not combinators with a nesting depth guard.

pub(crate) mod jsonpath;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::agent::types::{ExecutionRecord, ToolCallRecord};
use crate::template::TemplateContext;

const MAX_COMBINATOR_DEPTH: usize = 10;

/// One assertion as written in a test file. A node is a combinator when any
/// of anyOf/allOf/not is present, a leaf otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AssertionSpec {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(rename = "anyOf", default, skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<AssertionSpec>>,

    #[serde(rename = "allOf", default, skip_serializing_if = "Option::is_none")]
    pub all_of: Option<Vec<AssertionSpec>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<AssertionSpec>>,
}

/// Outcome of one evaluated assertion; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AssertionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AssertionResult {
    fn passed(kind: &str, message: String) -> Self {
        Self {
            kind: kind.to_string(),
            passed: true,
            message,
            details: None,
        }
    }

    fn failed(kind: &str, message: String) -> Self {
        Self {
            kind: kind.to_string(),
            passed: false,
            message,
            details: None,
        }
    }
}

/// Evaluate one assertion tree against the record. `known_tools` is the
/// agent's full tool set (for hallucination checks); `ctx` expands
/// {{var}} references in values and params before comparison.
pub(crate) fn evaluate(
    spec: &AssertionSpec,
    record: &ExecutionRecord,
    known_tools: &HashSet<String>,
    ctx: &TemplateContext,
) -> AssertionResult {
    // The guard dominates the whole tree: a too-deep assertion fails with
    // the prescribed message no matter what its leaves would say (a depth
    // failure under `not` must not be negated into a pass).
    if combinator_depth(spec) > MAX_COMBINATOR_DEPTH {
        return depth_exceeded(combinator_kind(spec).unwrap_or(spec.kind.as_str()));
    }
    evaluate_at(spec, record, known_tools, ctx)
}

/// Nesting depth in combinator levels; a leaf is 0.
fn combinator_depth(spec: &AssertionSpec) -> usize {
    let children_max = spec
        .any_of
        .iter()
        .flatten()
        .chain(spec.all_of.iter().flatten())
        .chain(spec.not.iter().map(|b| b.as_ref()))
        .map(combinator_depth)
        .max();
    match (combinator_kind(spec), children_max) {
        (Some(_), Some(depth)) => depth + 1,
        (Some(_), None) => 1,
        (None, _) => 0,
    }
}

fn combinator_kind(spec: &AssertionSpec) -> Option<&'static str> {
    if spec.any_of.is_some() {
        Some("anyOf")
    } else if spec.all_of.is_some() {
        Some("allOf")
    } else if spec.not.is_some() {
        Some("not")
    } else {
        None
    }
}

fn evaluate_at(
    spec: &AssertionSpec,
    record: &ExecutionRecord,
    known_tools: &HashSet<String>,
    ctx: &TemplateContext,
) -> AssertionResult {
    if let Some(ref children) = spec.any_of {
        return evaluate_group("anyOf", children, record, known_tools, ctx);
    }
    if let Some(ref children) = spec.all_of {
        return evaluate_group("allOf", children, record, known_tools, ctx);
    }
    if let Some(ref child) = spec.not {
        let inner = evaluate_at(child, record, known_tools, ctx);
        let passed = !inner.passed;
        return AssertionResult {
            kind: "not".to_string(),
            passed,
            message: if passed {
                format!("child assertion '{}' failed as required", inner.kind)
            } else {
                format!("child assertion '{}' passed but was negated", inner.kind)
            },
            details: Some(json!({ "child": inner })),
        };
    }

    evaluate_leaf(spec, record, known_tools, ctx)
}

fn evaluate_group(
    kind: &str,
    children: &[AssertionSpec],
    record: &ExecutionRecord,
    known_tools: &HashSet<String>,
    ctx: &TemplateContext,
) -> AssertionResult {
    let results: Vec<AssertionResult> = children
        .iter()
        .map(|c| evaluate_at(c, record, known_tools, ctx))
        .collect();
    let passed_count = results.iter().filter(|r| r.passed).count();
    let failed_count = results.len() - passed_count;

    let passed = match kind {
        "anyOf" => passed_count >= 1,
        _ => failed_count == 0,
    };

    AssertionResult {
        kind: kind.to_string(),
        passed,
        message: format!("{passed_count} of {} children passed", results.len()),
        details: Some(json!({
            "passed_count": passed_count,
            "failed_count": failed_count,
            "children": results,
        })),
    }
}

fn depth_exceeded(kind: &str) -> AssertionResult {
    AssertionResult::failed(kind, "Maximum combinator nesting depth exceeded".to_string())
}

fn evaluate_leaf(
    spec: &AssertionSpec,
    record: &ExecutionRecord,
    known_tools: &HashSet<String>,
    ctx: &TemplateContext,
) -> AssertionResult {
    let kind = spec.kind.as_str();
    let value = spec.value.as_ref().map(|v| expand_value(v, ctx));

    match kind {
        "tool_called" => {
            let Some(tool) = spec.tool.as_deref() else {
                return AssertionResult::failed(kind, "assertion is missing 'tool'".to_string());
            };
            if calls_to(record, tool).is_empty() {
                AssertionResult::failed(kind, format!("tool '{tool}' was not called"))
            } else {
                AssertionResult::passed(kind, format!("tool '{tool}' was called"))
            }
        }

        "tool_not_called" => {
            let Some(tool) = spec.tool.as_deref() else {
                return AssertionResult::failed(kind, "assertion is missing 'tool'".to_string());
            };
            if calls_to(record, tool).is_empty() {
                AssertionResult::passed(kind, format!("tool '{tool}' was not called"))
            } else {
                AssertionResult::failed(kind, format!("tool '{tool}' was called"))
            }
        }

        "tool_call_count" => {
            let Some(tool) = spec.tool.as_deref() else {
                return AssertionResult::failed(kind, "assertion is missing 'tool'".to_string());
            };
            let Some(expected) = spec.count else {
                return AssertionResult::failed(kind, "assertion is missing 'count'".to_string());
            };
            let actual = calls_to(record, tool).len() as i64;
            if actual == expected {
                AssertionResult::passed(kind, format!("tool '{tool}' was called {actual} times"))
            } else {
                AssertionResult::failed(
                    kind,
                    format!("tool '{tool}' was called {actual} times, expected {expected}"),
                )
            }
        }

        "tool_call_order" => {
            let Some(ref sequence) = spec.sequence else {
                return AssertionResult::failed(kind, "assertion is missing 'sequence'".to_string());
            };
            let observed: Vec<&str> = record.tool_calls.iter().map(|c| c.name.as_str()).collect();
            if is_subsequence(sequence, &observed) {
                AssertionResult::passed(kind, format!("calls followed order {sequence:?}"))
            } else {
                AssertionResult::failed(
                    kind,
                    format!("calls {observed:?} do not contain {sequence:?} in order"),
                )
            }
        }

        "tool_param_equals" => with_tool_calls(spec, record, kind, |calls| {
            let Some(ref params) = spec.params else {
                return AssertionResult::failed(kind, "assertion is missing 'params'".to_string());
            };
            let expected: Map<String, Value> = params
                .iter()
                .map(|(k, v)| (k.clone(), expand_value(v, ctx)))
                .collect();
            for call in calls {
                if expected.iter().all(|(key, want)| {
                    param_at(&call.parameters, key)
                        .map(|actual| values_equal(&actual, want))
                        .unwrap_or(false)
                }) {
                    return AssertionResult::passed(
                        kind,
                        format!("tool '{}' was called with matching params", call.name),
                    );
                }
            }
            AssertionResult::failed(
                kind,
                format!("no call to '{}' matched params {expected:?}", tool_of(spec)),
            )
        }),

        "tool_param_matches_regex" => with_tool_calls(spec, record, kind, |calls| {
            let Some(ref params) = spec.params else {
                return AssertionResult::failed(kind, "assertion is missing 'params'".to_string());
            };
            let mut patterns = Vec::new();
            for (key, raw) in params {
                let expanded = value_string(&expand_value(raw, ctx));
                match regex::Regex::new(&expanded) {
                    Ok(re) => patterns.push((key.clone(), re)),
                    Err(e) => {
                        return AssertionResult::failed(
                            kind,
                            format!("invalid regex for param '{key}': {e}"),
                        )
                    }
                }
            }
            for call in calls {
                if patterns.iter().all(|(key, re)| {
                    param_at(&call.parameters, key)
                        .map(|actual| re.is_match(&value_string(&actual)))
                        .unwrap_or(false)
                }) {
                    return AssertionResult::passed(
                        kind,
                        format!("tool '{}' params matched all patterns", call.name),
                    );
                }
            }
            AssertionResult::failed(
                kind,
                format!("no call to '{}' matched the param patterns", tool_of(spec)),
            )
        }),

        "tool_result_matches_json" => with_tool_calls(spec, record, kind, |calls| {
            let Some(ref path) = spec.path else {
                return AssertionResult::failed(kind, "assertion is missing 'path'".to_string());
            };
            let Some(ref expected) = value else {
                return AssertionResult::failed(kind, "assertion is missing 'value'".to_string());
            };
            let mut last_error = String::new();
            for call in calls {
                let text = call.result.first_text();
                let parsed: Value = match serde_json::from_str(text) {
                    Ok(v) => v,
                    Err(e) => {
                        last_error = format!("result is not JSON: {e}");
                        continue;
                    }
                };
                match jsonpath::eval(path, &parsed) {
                    Ok(actual) if values_equal(&actual, expected) => {
                        return AssertionResult::passed(
                            kind,
                            format!("result at '{path}' equals expected value"),
                        );
                    }
                    Ok(actual) => {
                        last_error = format!("value at '{path}' is {actual}, expected {expected}");
                    }
                    Err(e) => last_error = format!("path '{path}' failed: {e}"),
                }
            }
            AssertionResult::failed(kind, last_error)
        }),

        "output_contains" => {
            let Some(needle) = value.as_ref().map(value_string) else {
                return AssertionResult::failed(kind, "assertion is missing 'value'".to_string());
            };
            if record.final_output.contains(&needle) {
                AssertionResult::passed(kind, format!("output contains '{needle}'"))
            } else {
                AssertionResult::failed(kind, format!("output does not contain '{needle}'"))
            }
        }

        "output_not_contains" => {
            let Some(needle) = value.as_ref().map(value_string) else {
                return AssertionResult::failed(kind, "assertion is missing 'value'".to_string());
            };
            if record.final_output.contains(&needle) {
                AssertionResult::failed(kind, format!("output contains '{needle}'"))
            } else {
                AssertionResult::passed(kind, format!("output does not contain '{needle}'"))
            }
        }

        "output_regex" => {
            let Some(ref pattern) = spec.pattern else {
                return AssertionResult::failed(kind, "assertion is missing 'pattern'".to_string());
            };
            match regex::Regex::new(pattern) {
                Ok(re) if re.is_match(&record.final_output) => {
                    AssertionResult::passed(kind, format!("output matches /{pattern}/"))
                }
                Ok(_) => {
                    AssertionResult::failed(kind, format!("output does not match /{pattern}/"))
                }
                Err(e) => AssertionResult::failed(kind, format!("invalid pattern: {e}")),
            }
        }

        "max_tokens" => numeric_bound(kind, value.as_ref(), record.tokens_used, "tokens used"),

        "max_latency_ms" => numeric_bound(kind, value.as_ref(), record.latency_ms, "latency ms"),

        "no_error_messages" => {
            if record.errors.is_empty() {
                AssertionResult::passed(kind, "no errors recorded".to_string())
            } else {
                AssertionResult::failed(
                    kind,
                    format!(
                        "{} error(s) recorded, first: {}",
                        record.errors.len(),
                        record.errors[0]
                    ),
                )
            }
        }

        "no_hallucinated_tools" => {
            let unknown: Vec<&str> = record
                .tool_calls
                .iter()
                .map(|c| c.name.as_str())
                .filter(|name| !known_tools.contains(*name))
                .collect();
            if unknown.is_empty() {
                AssertionResult::passed(kind, "all called tools are known".to_string())
            } else {
                AssertionResult::failed(kind, format!("unknown tools called: {unknown:?}"))
            }
        }

        other => AssertionResult::failed(other, format!("unknown assertion type '{other}'")),
    }
}

fn tool_of(spec: &AssertionSpec) -> &str {
    spec.tool.as_deref().unwrap_or("")
}

/// Run `body` over the calls to the assertion's tool; a tool that was never
/// called fails with the prescribed existential message.
fn with_tool_calls<'a, F>(
    spec: &AssertionSpec,
    record: &'a ExecutionRecord,
    kind: &str,
    body: F,
) -> AssertionResult
where
    F: FnOnce(Vec<&'a ToolCallRecord>) -> AssertionResult,
{
    let Some(tool) = spec.tool.as_deref() else {
        return AssertionResult::failed(kind, "assertion is missing 'tool'".to_string());
    };
    let calls = calls_to(record, tool);
    if calls.is_empty() {
        return AssertionResult::failed(kind, format!("tool '{tool}' was not called"));
    }
    body(calls)
}

fn calls_to<'a>(record: &'a ExecutionRecord, tool: &str) -> Vec<&'a ToolCallRecord> {
    record.tool_calls.iter().filter(|c| c.name == tool).collect()
}

fn numeric_bound(
    kind: &str,
    value: Option<&Value>,
    actual: u64,
    label: &str,
) -> AssertionResult {
    let Some(raw) = value.map(value_string) else {
        return AssertionResult::failed(kind, "assertion is missing 'value'".to_string());
    };
    let limit = atoi(&raw);
    if actual <= limit {
        AssertionResult::passed(kind, format!("{label} {actual} <= {limit}"))
    } else {
        AssertionResult::failed(kind, format!("{label} {actual} exceeds limit {limit}"))
    }
}

/// atoi semantics: skip leading whitespace, take an optional sign and the
/// leading digit run, 0 when there is none. Never errors.
fn atoi(s: &str) -> u64 {
    let trimmed = s.trim_start();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if negative {
        return 0;
    }
    let digits: &str = &rest[..rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(rest.len())];
    digits.parse().unwrap_or(0)
}

/// Subsequence check: every element of `sequence` appears in `observed` in
/// order, not necessarily contiguously.
fn is_subsequence(sequence: &[String], observed: &[&str]) -> bool {
    let mut remaining = sequence.iter();
    let mut want = remaining.next();
    for name in observed {
        match want {
            Some(w) if w == name => want = remaining.next(),
            Some(_) => {}
            None => break,
        }
    }
    want.is_none()
}

/// Expand {{var}} references in every string of a value tree.
fn expand_value(value: &Value, ctx: &TemplateContext) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.render(s)),
        Value::Array(items) => Value::Array(items.iter().map(|i| expand_value(i, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Look up a possibly dot-separated key inside a parameter map.
fn param_at(params: &Map<String, Value>, key: &str) -> Option<Value> {
    if let Some(value) = params.get(key) {
        return Some(value.clone());
    }
    let mut parts = key.split('.');
    let mut current = params.get(parts.next()?)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

/// Deep equality: arrays compare order-independently, scalars also compare
/// by their string forms (so "42" equals 42).
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return false;
            }
            let mut used = vec![false; a.len()];
            'outer: for want in b {
                for (i, have) in a.iter().enumerate() {
                    if !used[i] && values_equal(have, want) {
                        used[i] = true;
                        continue 'outer;
                    }
                }
                return false;
            }
            true
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && b.iter()
                    .all(|(k, want)| a.get(k).map(|have| values_equal(have, want)).unwrap_or(false))
        }
        (a, b) if a == b => true,
        (a, b) => value_string(a) == value_string(b),
    }
}

/// The string form of a value: bare for strings, JSON text otherwise.
fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
