// Streamable HTTP transport: one POST per JSON-RPC call.
//
// Servers may answer with plain JSON or with a single SSE-framed event;
// both are handled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::agent::types::{ToolDefinition, ToolOutcome};
use crate::config::{duration_or, ServerConfig};

use super::{
    initialize_params, parse_headers, parse_server_info, parse_tool_list, parse_tool_outcome,
    rpc_notification, rpc_request, rpc_result, ServerInfo,
};

pub(crate) struct HttpServer {
    name: String,
    server_delay: Duration,
    client: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    url: String,
    next_id: AtomicU64,
    closed: AtomicBool,
    first_list_done: AtomicBool,
}

impl HttpServer {
    pub fn connect(config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("http server '{}' requires a url", config.name))?;

        Ok(Self {
            name: config.name.clone(),
            server_delay: duration_or(config.server_delay.as_deref(), Duration::ZERO),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .context("building http client")?,
            headers: parse_headers(&config.headers)?,
            url,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            first_list_done: AtomicBool::new(false),
        })
    }

    pub async fn initialize(&self) -> Result<ServerInfo> {
        let result = self.request("initialize", initialize_params()).await?;
        // Fire-and-forget; some servers answer notifications with 202.
        let _ = self.send(&rpc_notification("notifications/initialized")).await;
        Ok(parse_server_info(&result))
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        if !self.first_list_done.swap(true, Ordering::SeqCst) && !self.server_delay.is_zero() {
            tokio::time::sleep(self.server_delay).await;
        }
        let result = self.request("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result))
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": args}))
            .await?;
        Ok(parse_tool_outcome(&result))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("http server '{}' is closed", self.name);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let response = self.send(&rpc_request(id, method, params)).await?;
        rpc_result(response)
    }

    async fn send(&self, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .json(payload)
            .send()
            .await
            .with_context(|| format!("calling http server '{}'", self.name))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("http server '{}' returned {}", self.name, status);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            return Ok(Value::Null);
        }

        if content_type.starts_with("text/event-stream") {
            return first_sse_payload(&body).with_context(|| {
                format!("http server '{}' sent an empty event stream", self.name)
            });
        }

        serde_json::from_str(&body)
            .with_context(|| format!("parsing response from http server '{}'", self.name))
    }
}

/// Extract the first data payload from an SSE-framed response body.
fn first_sse_payload(body: &str) -> Option<Value> {
    let mut data_lines = Vec::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data_lines.is_empty() {
                break;
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    serde_json::from_str(&data_lines.join("\n")).ok()
}
