// SSE transport: a long-lived event stream from the server, paired with a
// POST endpoint for requests.
//
// The first `endpoint` event names where requests go; responses come back
// over the stream as `message` events and are correlated by JSON-RPC id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::agent::types::{ToolDefinition, ToolOutcome};
use crate::config::{duration_or, ServerConfig};

use super::{
    initialize_params, parse_headers, parse_server_info, parse_tool_list, parse_tool_outcome,
    rpc_notification, rpc_request, rpc_result, ServerInfo,
};

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Responses routed by id: a waiting request gets a oneshot; a response that
/// lands before its request registers is parked in `early`.
#[derive(Default)]
struct Routing {
    pending: HashMap<u64, oneshot::Sender<Value>>,
    early: HashMap<u64, Value>,
}

pub(crate) struct SseServer {
    name: String,
    server_delay: Duration,
    client: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    endpoint: String,
    routing: Arc<Mutex<Routing>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    first_list_done: AtomicBool,
}

impl SseServer {
    /// Open the event stream, learn the POST endpoint, and start the
    /// response router.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("sse server '{}' requires a url", config.name))?;
        let headers = parse_headers(&config.headers)?;

        let client = reqwest::Client::builder()
            .build()
            .context("building http client")?;

        let response = client
            .get(url)
            .headers(headers.clone())
            .header("accept", "text/event-stream")
            .send()
            .await
            .with_context(|| format!("connecting to sse server '{}'", config.name))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "sse server '{}' returned {}",
                config.name,
                response.status()
            );
        }

        let mut reader = EventReader::new(response.bytes_stream());

        // The server announces its request endpoint before anything else.
        let endpoint_path = tokio::time::timeout(ENDPOINT_TIMEOUT, async {
            loop {
                match reader.next_event().await? {
                    Some(event) if event.name.as_deref() == Some("endpoint") => {
                        return Ok(event.data.trim().to_string());
                    }
                    Some(_) => continue,
                    None => anyhow::bail!("event stream ended before an endpoint event"),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("sse server '{}' sent no endpoint event", config.name))??;

        let base: reqwest::Url = url.parse().context("parsing sse url")?;
        let endpoint = base
            .join(&endpoint_path)
            .context("resolving endpoint url")?
            .to_string();

        let routing = Arc::new(Mutex::new(Routing::default()));
        let reader = tokio::spawn(route_events(reader, Arc::clone(&routing)));

        Ok(Self {
            name: config.name.clone(),
            server_delay: duration_or(config.server_delay.as_deref(), Duration::ZERO),
            client,
            headers,
            endpoint,
            routing,
            reader: Mutex::new(Some(reader)),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            first_list_done: AtomicBool::new(false),
        })
    }

    pub async fn initialize(&self) -> Result<ServerInfo> {
        let result = self.request("initialize", initialize_params()).await?;
        self.post(&rpc_notification("notifications/initialized"))
            .await?;
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

    /// Stop the router and refuse further calls. Safe to call repeatedly.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        let mut routing = self.routing.lock();
        routing.pending.clear();
        routing.early.clear();
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("sse server '{}' is closed", self.name);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let rx = {
            let mut routing = self.routing.lock();
            if let Some(early) = routing.early.remove(&id) {
                return rpc_result(early);
            }
            let (tx, rx) = oneshot::channel();
            routing.pending.insert(id, tx);
            rx
        };

        self.post(&rpc_request(id, method, params)).await?;

        let response = match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => anyhow::bail!("sse server '{}' dropped the response channel", self.name),
            Err(_) => {
                self.routing.lock().pending.remove(&id);
                anyhow::bail!(
                    "sse server '{}' did not answer {method} within {}s",
                    self.name,
                    RESPONSE_TIMEOUT.as_secs()
                );
            }
        };
        rpc_result(response)
    }

    async fn post(&self, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "sse server '{}' rejected request: {}",
                self.name,
                response.status()
            );
        }
        Ok(())
    }
}

/// Consume the event stream, routing responses to their waiting requests.
async fn route_events<S>(mut reader: EventReader<S>, routing: Arc<Mutex<Routing>>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin + Send,
{
    loop {
        let event = match reader.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "sse stream error");
                break;
            }
        };
        match event.name.as_deref() {
            Some("message") | None => {}
            _ => continue,
        }
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparsable sse message");
                continue;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            continue; // server-side notification
        };
        let mut routing = routing.lock();
        match routing.pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => {
                routing.early.insert(id, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event-stream framing
// ---------------------------------------------------------------------------

/// One server-sent event: its `event:` name (if any) and joined `data:`.
#[derive(Debug, Clone)]
struct ServerEvent {
    name: Option<String>,
    data: String,
}

/// Pull-based reader over the raw byte stream. Events are framed by blank
/// lines; the reader buffers bytes until a whole block is available and
/// parses it in one pass.
struct EventReader<S> {
    bytes: S,
    buffer: String,
}

impl<S> EventReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    fn new(bytes: S) -> Self {
        Self {
            bytes,
            buffer: String::new(),
        }
    }

    /// The next complete event, or None when the stream ends. Blocks with
    /// no data lines (comments, keepalives) are skipped.
    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            while let Some(boundary) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..boundary + 2).collect();
                if let Some(event) = parse_event_block(&block) {
                    return Ok(Some(event));
                }
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.push_chunk(&chunk),
                Some(Err(e)) => anyhow::bail!("sse stream error: {e}"),
                None => {
                    // End of stream: whatever is buffered is the last block.
                    let rest = std::mem::take(&mut self.buffer);
                    return Ok(parse_event_block(&rest));
                }
            }
        }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        // Carriage returns only ever appear as line terminators here (JSON
        // payloads escape them), so dropping them normalizes CRLF framing.
        for c in String::from_utf8_lossy(chunk).chars() {
            if c != '\r' {
                self.buffer.push(c);
            }
        }
    }
}

/// Parse one blank-line-delimited block into an event. Returns None for
/// blocks carrying no data (comment-only keepalives).
fn parse_event_block(block: &str) -> Option<ServerEvent> {
    let mut name = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => name = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {} // id, retry: not needed here
        }
    }

    data.map(|data| ServerEvent { name, data })
}
