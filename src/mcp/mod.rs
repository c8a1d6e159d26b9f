// MCP server pool: uniform client surface over four transport kinds.
//
// Every variant exposes initialize / list_tools / call_tool / close. The
// pool owns the servers for the whole run; construction is fail-atomic
// (a failure closes everything built so far before propagating).

pub(crate) mod cli;
pub(crate) mod http;
pub(crate) mod sse;
pub(crate) mod stdio;

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::agent::types::{ContentItem, ToolDefinition, ToolOutcome};
use crate::config::ServerConfig;

pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";

/// Handshake result from a server.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// A connected tool server of one of the four transport kinds.
pub(crate) enum McpServer {
    Stdio(stdio::StdioServer),
    Sse(sse::SseServer),
    Http(http::HttpServer),
    Cli(cli::CliServer),
}

impl McpServer {
    /// Connect per the config's transport kind. The server is usable only
    /// after `initialize`.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        match config.kind.as_str() {
            "stdio" => Ok(Self::Stdio(stdio::StdioServer::connect(config).await?)),
            "sse" => Ok(Self::Sse(sse::SseServer::connect(config).await?)),
            "http" => Ok(Self::Http(http::HttpServer::connect(config)?)),
            "cli" => Ok(Self::Cli(cli::CliServer::new(config)?)),
            other => anyhow::bail!("unknown server type '{}'", other),
        }
    }

    pub async fn initialize(&self) -> Result<ServerInfo> {
        match self {
            Self::Stdio(s) => s.initialize().await,
            Self::Sse(s) => s.initialize().await,
            Self::Http(s) => s.initialize().await,
            Self::Cli(s) => s.initialize().await,
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        match self {
            Self::Stdio(s) => s.list_tools().await,
            Self::Sse(s) => s.list_tools().await,
            Self::Http(s) => s.list_tools().await,
            Self::Cli(s) => s.list_tools().await,
        }
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        match self {
            Self::Stdio(s) => s.call_tool(name, args).await,
            Self::Sse(s) => s.call_tool(name, args).await,
            Self::Http(s) => s.call_tool(name, args).await,
            Self::Cli(s) => s.call_tool(name, args).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Stdio(s) => s.close().await,
            Self::Sse(s) => s.close().await,
            Self::Http(s) => s.close(),
            Self::Cli(s) => s.close(),
        }
    }
}

/// Owns every configured server for the duration of the run.
pub(crate) struct ServerPool {
    servers: HashMap<String, McpServer>,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServerPool {
    /// Connect and initialize every server. On any failure the servers
    /// already built are closed before the error propagates.
    pub async fn build(configs: &[ServerConfig]) -> Result<Self> {
        let mut pool = Self {
            servers: HashMap::new(),
        };

        for config in configs {
            if pool.servers.contains_key(&config.name) {
                pool.close_all().await;
                anyhow::bail!("duplicate server name '{}'", config.name);
            }
            let server = match Self::bring_up(config).await {
                Ok(server) => server,
                Err(e) => {
                    pool.close_all().await;
                    return Err(e.context(format!("initializing server '{}'", config.name)));
                }
            };
            pool.servers.insert(config.name.clone(), server);
        }

        Ok(pool)
    }

    async fn bring_up(config: &ServerConfig) -> Result<McpServer> {
        let server = McpServer::connect(config).await?;
        let info = match server.initialize().await {
            Ok(info) => info,
            Err(e) => {
                server.close().await;
                return Err(e);
            }
        };
        tracing::info!(
            server = %config.name,
            kind = %config.kind,
            remote = %info.name,
            version = %info.version,
            "server initialized"
        );
        Ok(server)
    }

    pub fn get(&self, name: &str) -> Option<&McpServer> {
        self.servers.get(name)
    }

    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> Result<ToolOutcome> {
        let server = self
            .get(server)
            .with_context(|| format!("unknown server '{server}'"))?;
        server.call_tool(tool, args).await
    }

    /// Close every server. Safe to call more than once.
    pub async fn close_all(&self) {
        for (name, server) in &self.servers {
            tracing::debug!(server = %name, "closing server");
            server.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC plumbing shared by the wire transports
// ---------------------------------------------------------------------------

pub(crate) fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub(crate) fn rpc_notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
    })
}

pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "agentbench",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Unwrap a JSON-RPC response envelope into its result.
pub(crate) fn rpc_result(response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let code = error["code"].as_i64().unwrap_or(0);
        let message = error["message"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server error {code}: {message}");
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

pub(crate) fn parse_server_info(result: &Value) -> ServerInfo {
    ServerInfo {
        name: result["serverInfo"]["name"].as_str().unwrap_or("").to_string(),
        version: result["serverInfo"]["version"]
            .as_str()
            .unwrap_or("")
            .to_string(),
    }
}

/// tools/list result -> tool definitions.
pub(crate) fn parse_tool_list(result: &Value) -> Vec<ToolDefinition> {
    result["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(ToolDefinition {
                        name: t["name"].as_str()?.to_string(),
                        description: t["description"].as_str().unwrap_or("").to_string(),
                        input_schema: t
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object"})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// tools/call result -> outcome.
pub(crate) fn parse_tool_outcome(result: &Value) -> ToolOutcome {
    let content = result["content"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| ContentItem {
                    kind: item["type"].as_str().unwrap_or("text").to_string(),
                    text: item["text"].as_str().unwrap_or("").to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    ToolOutcome {
        content,
        structured: result.get("structuredContent").cloned(),
        is_error: result["isError"].as_bool().unwrap_or(false),
    }
}

/// Parse "Key: Value" strings into a reqwest header map.
pub(crate) fn parse_headers(headers: &[String]) -> Result<reqwest::header::HeaderMap> {
    let mut map = reqwest::header::HeaderMap::new();
    for raw in headers {
        let (key, value) = raw
            .split_once(':')
            .with_context(|| format!("malformed header '{raw}', expected 'Key: Value'"))?;
        let name: reqwest::header::HeaderName = key
            .trim()
            .parse()
            .with_context(|| format!("invalid header name in '{raw}'"))?;
        let value: reqwest::header::HeaderValue = value
            .trim()
            .parse()
            .with_context(|| format!("invalid header value in '{raw}'"))?;
        map.insert(name, value);
    }
    Ok(map)
}
