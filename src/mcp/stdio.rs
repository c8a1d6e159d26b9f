// Stdio transport: the server is a child process speaking newline-delimited
// JSON-RPC on stdin/stdout.
//
// The command line runs through the shell so quoting behaves the way it
// does in a terminal. Calls are serialized by a mutex over the pipes.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::agent::types::{ToolDefinition, ToolOutcome};
use crate::config::{duration_or, ServerConfig};

use super::{
    initialize_params, parse_server_info, parse_tool_list, parse_tool_outcome, rpc_notification,
    rpc_request, rpc_result, ServerInfo,
};

/// Upper bound on waiting for a single response line.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct StdioServer {
    name: String,
    server_delay: Duration,
    io: Mutex<Option<Io>>,
    first_list_done: AtomicBool,
}

struct Io {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioServer {
    /// Spawn the child and wait out `process_delay` so slow servers can
    /// finish warming up before the handshake.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let command_line = config
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("stdio server '{}' requires a command", config.name))?;

        let shell = if std::path::Path::new("/bin/sh").exists() {
            "/bin/sh"
        } else {
            "sh"
        };
        let mut child = tokio::process::Command::new(shell)
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning stdio server '{}'", config.name))?;

        let stdin = child
            .stdin
            .take()
            .context("child process has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("child process has no stdout pipe")?;

        let process_delay = duration_or(config.process_delay.as_deref(), Duration::ZERO);
        if !process_delay.is_zero() {
            tokio::time::sleep(process_delay).await;
        }

        Ok(Self {
            name: config.name.clone(),
            server_delay: duration_or(config.server_delay.as_deref(), Duration::ZERO),
            io: Mutex::new(Some(Io {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 0,
            })),
            first_list_done: AtomicBool::new(false),
        })
    }

    pub async fn initialize(&self) -> Result<ServerInfo> {
        let result = self.request("initialize", initialize_params()).await?;
        self.notify("notifications/initialized").await?;
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

    /// Kill and reap the child. Safe to call more than once.
    pub async fn close(&self) {
        let mut guard = self.io.lock().await;
        if let Some(mut io) = guard.take() {
            let _ = io.child.start_kill();
            let _ = io.child.wait().await;
        }
    }

    /// One serialized request/response round trip.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .with_context(|| format!("stdio server '{}' is closed", self.name))?;

        io.next_id += 1;
        let id = io.next_id;
        let payload = serde_json::to_string(&rpc_request(id, method, params))?;
        io.stdin.write_all(payload.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, read_response(io, id))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "stdio server '{}' did not answer {method} within {}s",
                    self.name,
                    RESPONSE_TIMEOUT.as_secs()
                )
            })??;
        rpc_result(response)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .with_context(|| format!("stdio server '{}' is closed", self.name))?;
        let payload = serde_json::to_string(&rpc_notification(method))?;
        io.stdin.write_all(payload.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        Ok(())
    }
}

/// Read lines until the response with the expected id arrives, skipping
/// server-initiated notifications and unparsable noise.
async fn read_response(io: &mut Io, id: u64) -> Result<Value> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = io.stdout.read_line(&mut line).await?;
        if read == 0 {
            anyhow::bail!("server process closed its stdout");
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparsable stdio line");
                continue;
            }
        };
        if value.get("id").and_then(Value::as_u64) == Some(id) {
            return Ok(value);
        }
        // Notification or a response to something else; keep reading.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// A canned MCP server: answers initialize, tools/list, and one
    /// tools/call in protocol order.
    fn fake_server_script() -> tempfile::NamedTempFile {
        let script = r#"#!/bin/sh
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"1.0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"ping","description":"Ping it","inputSchema":{"type":"object"}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}],"isError":false}}'
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(script.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn config(script_path: &str) -> ServerConfig {
        ServerConfig {
            name: "fake".into(),
            kind: "stdio".into(),
            command: Some(format!("sh {script_path}")),
            url: None,
            headers: vec![],
            server_delay: None,
            process_delay: None,
            shell: None,
            working_dir: None,
            tool_prefix: None,
            help_command: None,
            disable_help_auto_discovery: false,
        }
    }

    #[tokio::test]
    async fn test_full_protocol_round_trip() {
        let script = fake_server_script();
        let server = StdioServer::connect(&config(&script.path().to_string_lossy()))
            .await
            .unwrap();

        let info = server.initialize().await.unwrap();
        assert_eq!(info.name, "fake");
        assert_eq!(info.version, "1.0");

        let tools = server.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");

        let outcome = server.call_tool("ping", json!({})).await.unwrap();
        assert_eq!(outcome.first_text(), "pong");

        server.close().await;
    }

    #[tokio::test]
    async fn test_closed_server_errors() {
        let script = fake_server_script();
        let server = StdioServer::connect(&config(&script.path().to_string_lossy()))
            .await
            .unwrap();
        server.close().await;
        server.close().await; // idempotent
        assert!(server.call_tool("ping", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_server_exit_is_detected() {
        let mut cfg = config("ignored");
        cfg.command = Some("true".into());
        let server = StdioServer::connect(&cfg).await.unwrap();
        // The child exits immediately, so the handshake must fail rather
        // than hang.
        assert!(server.initialize().await.is_err());
        server.close().await;
    }
}
