//! Minimal stdio MCP server used by the integration tests and for demos.
//!
//! Tools: `echo`, `sleep`, `fail`, `crash`, `list_count`. Requests are served
//! concurrently, so a slow `sleep` never holds up other replies.
//!
//! Environment knobs:
//! - `ECHO_MCP_NOISE=1` writes a non-JSON line to stdout before every reply
//! - `ECHO_MCP_PAGE_SIZE=n` splits `tools/list` into pages of `n`
//! - `ECHO_MCP_INIT_DELAY_MS=n` delays the `initialize` reply

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use mcp_bridge::mcp_client::types::{error_codes, PROTOCOL_VERSION};

/// Application-defined JSON-RPC error code returned by `fail`.
const TOOL_FAILED: i64 = -32000;

struct Options {
    noise: bool,
    page_size: Option<usize>,
    init_delay: Duration,
}

impl Options {
    fn from_env() -> Self {
        let number = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            noise: std::env::var("ECHO_MCP_NOISE").is_ok_and(|v| v == "1"),
            page_size: number("ECHO_MCP_PAGE_SIZE")
                .filter(|n| *n > 0)
                .map(|n| n as usize),
            init_delay: Duration::from_millis(number("ECHO_MCP_INIT_DELAY_MS").unwrap_or(0)),
        }
    }
}

struct EchoServer {
    options: Options,
    list_calls: AtomicU64,
    out: mpsc::UnboundedSender<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let server = Arc::new(EchoServer {
        options: Options::from_env(),
        list_calls: AtomicU64::new(0),
        out: out_tx,
    });
    tracing::info!(pid = std::process::id(), "echo-mcp-server ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                server.send(error_reply(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    &format!("parse error: {e}"),
                ));
                continue;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Some(reply) = server.handle(message).await {
                server.send(reply);
            }
        });
    }

    tracing::info!("stdin closed, exiting");
    drop(server);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    Ok(())
}

impl EchoServer {
    fn send(&self, reply: Value) {
        if self.options.noise {
            let _ = self.out.send("~~ not a json-rpc message ~~".to_string());
        }
        let _ = self.out.send(reply.to_string());
    }

    /// Reply for one inbound message; `None` for notifications and responses.
    async fn handle(&self, message: Value) -> Option<Value> {
        let method = message.get("method").and_then(Value::as_str)?.to_string();
        let Some(id) = message.get("id").cloned() else {
            tracing::debug!(method = %method, "notification");
            return None;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method.as_str() {
            "initialize" => {
                tokio::time::sleep(self.options.init_delay).await;
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "echo-mcp-server",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools(&params)),
            "tools/call" => self.call_tool(&params).await,
            other => Err((
                error_codes::METHOD_NOT_FOUND,
                format!("method '{other}' not found"),
            )),
        };

        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_reply(id, code, &message),
        })
    }

    fn list_tools(&self, params: &Value) -> Value {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let tools = tool_descriptors();

        let Some(page_size) = self.options.page_size else {
            return json!({ "tools": tools });
        };
        let start = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(tools.len());
        let end = (start + page_size).min(tools.len());

        let mut page = json!({ "tools": &tools[start..end] });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((error_codes::INVALID_PARAMS, "missing tool name".to_string()))?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let text = match name {
            "echo" => args
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                format!("slept {ms}ms")
            }
            "fail" => {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("tool failed");
                return Err((TOOL_FAILED, message.to_string()));
            }
            "crash" => {
                let code = args.get("code").and_then(Value::as_i64).unwrap_or(1);
                tracing::warn!(code, "crashing on request");
                std::process::exit(code as i32);
            }
            "list_count" => self.list_calls.load(Ordering::SeqCst).to_string(),
            other => {
                return Err((
                    error_codes::INVALID_PARAMS,
                    format!("unknown tool '{other}'"),
                ))
            }
        };

        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
    }
}

fn tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "echo",
            "description": "Return the given text",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            },
        }),
        json!({
            "name": "sleep",
            "description": "Wait for `ms` milliseconds, then reply",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
            },
        }),
        json!({
            "name": "fail",
            "description": "Reject the call with a JSON-RPC error",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
            },
        }),
        json!({
            "name": "crash",
            "description": "Exit the server process immediately",
            "inputSchema": {
                "type": "object",
                "properties": { "code": { "type": "integer" } },
            },
        }),
        json!({
            "name": "list_count",
            "description": "Number of tools/list requests served so far",
            "inputSchema": { "type": "object" },
        }),
    ]
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
