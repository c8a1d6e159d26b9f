// Data extraction: pull JSONPath values out of tool results into the
// session template context for later prompts and assertions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::types::ExecutionRecord;
use crate::assertions::jsonpath;
use crate::template::TemplateContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExtractorSpec {
    /// Only "jsonpath" is supported.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Tool whose results to read.
    pub tool: String,

    /// JSONPath into the first text content entry.
    pub path: String,

    pub variable_name: String,
}

fn default_kind() -> String {
    "jsonpath".to_string()
}

/// Run every extractor over the record, writing stringified results into
/// the session context. Failures are logged and never fatal.
pub(crate) fn run_extractors(
    extractors: &[ExtractorSpec],
    record: &ExecutionRecord,
    ctx: &mut TemplateContext,
) {
    for extractor in extractors {
        if extractor.kind != "jsonpath" {
            tracing::warn!(
                kind = %extractor.kind,
                variable = %extractor.variable_name,
                "unknown extractor type, skipping"
            );
            continue;
        }

        for call in record.tool_calls.iter().filter(|c| c.name == extractor.tool) {
            let text = call.result.first_text();
            let parsed: Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        tool = %extractor.tool,
                        variable = %extractor.variable_name,
                        error = %e,
                        "tool result is not JSON, skipping extraction"
                    );
                    continue;
                }
            };
            match jsonpath::eval(&extractor.path, &parsed) {
                Ok(value) => {
                    let rendered = stringify(&value);
                    tracing::debug!(
                        variable = %extractor.variable_name,
                        value = %rendered,
                        "extracted variable"
                    );
                    ctx.set(&extractor.variable_name, &rendered);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %extractor.path,
                        variable = %extractor.variable_name,
                        error = %e,
                        "jsonpath evaluation failed, skipping extraction"
                    );
                }
            }
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
