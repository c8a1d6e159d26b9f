// Synthetic CLI server: wraps one command-line tool as a single MCP tool.
//
// The tool is named `{tool_prefix}_execute`; its `args` string is appended
// to the configured command and run through the shell. Combined stdout and
// stderr become the result text; a nonzero exit sets is_error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::agent::types::{ToolDefinition, ToolOutcome};
use crate::config::ServerConfig;

use super::ServerInfo;

const HELP_TIMEOUT_MS: u64 = 30_000;
const EXEC_TIMEOUT_MS: u64 = 600_000;
const MAX_DESCRIPTION_CHARS: usize = 4_000;

pub(crate) struct CliServer {
    name: String,
    command: String,
    shell: String,
    working_dir: Option<PathBuf>,
    tool_prefix: String,
    help_command: Option<String>,
    help_discovery: bool,
    description: Mutex<String>,
    closed: AtomicBool,
}

impl CliServer {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cli server '{}' requires a command", config.name))?;

        let tool_prefix = match config.tool_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => prefix.to_string(),
            _ => sanitize_prefix(&config.name),
        };

        Ok(Self {
            name: config.name.clone(),
            command,
            shell: Self::pick_shell(config.shell.as_deref()),
            working_dir: config.working_dir.clone().map(PathBuf::from),
            tool_prefix,
            help_command: config.help_command.clone().filter(|c| !c.is_empty()),
            help_discovery: !config.disable_help_auto_discovery,
            description: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The shell everything runs through: the configured one, else $SHELL
    /// when it points at a real binary, else the first stock shell found.
    fn pick_shell(configured: Option<&str>) -> String {
        if let Some(shell) = configured.filter(|s| !s.is_empty()) {
            return shell.to_string();
        }
        std::env::var("SHELL")
            .ok()
            .filter(|s| std::path::Path::new(s).exists())
            .or_else(|| {
                ["/bin/bash", "/bin/sh"]
                    .into_iter()
                    .find(|p| std::path::Path::new(p).exists())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "sh".to_string())
    }

    /// No handshake to perform; help auto-discovery runs here so the tool
    /// description is ready before the first list_tools.
    pub async fn initialize(&self) -> Result<ServerInfo> {
        let mut description = format!("Execute the '{}' command-line tool.", self.command);

        if self.help_discovery {
            let help_command = match &self.help_command {
                Some(cmd) => cmd.clone(),
                None => format!("{} --help", self.command),
            };
            match self.run(&help_command, HELP_TIMEOUT_MS).await {
                Ok(outcome) => {
                    let help = truncate_chars(outcome.first_text(), MAX_DESCRIPTION_CHARS);
                    if !help.is_empty() {
                        description.push_str("\n\nUsage:\n");
                        description.push_str(&help);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %self.name, error = %e, "help discovery failed");
                }
            }
        }

        *self.description.lock() = description;
        Ok(ServerInfo {
            name: self.name.clone(),
            version: "cli".to_string(),
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.ensure_open()?;
        Ok(vec![ToolDefinition {
            name: format!("{}_execute", self.tool_prefix),
            description: self.description.lock().clone(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "args": {
                        "type": "string",
                        "description": "Arguments appended to the command line"
                    }
                }
            }),
        }])
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome> {
        self.ensure_open()?;
        let expected = format!("{}_execute", self.tool_prefix);
        if name != expected {
            anyhow::bail!("unknown tool '{name}' on cli server '{}'", self.name);
        }

        let extra = args["args"].as_str().unwrap_or("");
        let command_line = if extra.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, extra)
        };
        self.run(&command_line, EXEC_TIMEOUT_MS).await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("cli server '{}' is closed", self.name);
        }
        Ok(())
    }

    /// Run a command line through the shell, capturing stdout and stderr.
    async fn run(&self, command_line: &str, timeout_ms: u64) -> Result<ToolOutcome> {
        let mut command = tokio::process::Command::new(&self.shell);
        command
            .arg("-c")
            .arg(command_line)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn command: {e}"))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| anyhow::anyhow!("command execution error: {e}"))?
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                return Ok(ToolOutcome::error(format!(
                    "Command timed out after {timeout_ms}ms"
                )));
            }
        };

        Ok(Self::outcome_from(&output))
    }

    /// Fold a finished process into a tool outcome: stdout and stderr
    /// concatenated as labeled sections, nonzero exit marked as an error.
    fn outcome_from(output: &std::process::Output) -> ToolOutcome {
        let mut sections: Vec<String> = Vec::new();

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            sections.push(stdout.into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            sections.push(format!("[stderr]\n{stderr}"));
        }
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            sections.push(format!("[exit status: {exit_code}]"));
        }

        let text = if sections.is_empty() {
            "(no output)".to_string()
        } else {
            sections.join("\n")
        };

        if exit_code != 0 {
            ToolOutcome::error(text)
        } else {
            ToolOutcome::text(text)
        }
    }
}

fn sanitize_prefix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.trim().to_string();
    }
    s.chars().take(max).collect::<String>().trim().to_string()
}
