//! JSON-RPC over stdio transport.
//!
//! Spawns an MCP server as a child process and talks newline-delimited
//! JSON-RPC 2.0 over its stdin/stdout. Three background tasks serve each
//! process:
//! - a stdout reader that frames lines and routes replies by id
//! - a stderr drain that logs server output (and keeps a short tail for
//!   handshake diagnostics)
//! - an exit monitor that owns the `Child` and runs the closure path when the
//!   process goes away

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framing::LineBuffer;
use super::pending::PendingRequests;
use super::protocol;
use super::transport::{DisconnectNotifier, McpTransport, StatusCell};
use super::types::{
    parse_incoming, CallToolParams, CallToolResult, ConnectionStatus,
    IncomingMessage, JsonRpcNotification, JsonRpcRequest, ToolDescriptor,
};
use crate::config::ManagerSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Reason attached to requests rejected because the process went away.
const PROCESS_EXITED: &str = "process exited unexpectedly";

/// Number of stderr lines kept for handshake failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Read size for the stdout pump.
const READ_CHUNK: usize = 8 * 1024;

// ─── StdioClient ─────────────────────────────────────────────────────────────

/// Client for one MCP server reached through a child process.
pub struct StdioClient {
    shared: Arc<StdioShared>,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    settings: ManagerSettings,
    /// Live process session. The lock also serializes connect/disconnect.
    session: Mutex<Option<Arc<StdioSession>>>,
}

/// State that outlives a single process: status, tool cache, notifier.
struct StdioShared {
    server_id: String,
    status: StatusCell,
    tools: Mutex<Option<Vec<ToolDescriptor>>>,
    notifier: Option<DisconnectNotifier>,
}

impl StdioClient {
    pub fn new(
        server_id: &str,
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
        timeout: Duration,
        settings: ManagerSettings,
        notifier: Option<DisconnectNotifier>,
    ) -> Self {
        Self {
            shared: Arc::new(StdioShared {
                server_id: server_id.to_string(),
                status: StatusCell::new(),
                tools: Mutex::new(None),
                notifier,
            }),
            command: command.to_string(),
            args,
            env,
            timeout,
            settings,
            session: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    /// Watch the lifecycle state.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// OS process id of the running server, if any.
    pub async fn process_id(&self) -> Option<u32> {
        self.session.lock().await.as_ref().and_then(|s| s.pid)
    }

    /// Requests currently awaiting a reply.
    pub async fn pending_requests(&self) -> usize {
        match self.session.lock().await.as_ref() {
            Some(session) => session.pending.len().await,
            None => 0,
        }
    }

    /// Send a raw request on the live connection.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let session = self.live_session().await?;
        session.request(method, params, self.timeout).await
    }

    async fn live_session(&self) -> Result<Arc<StdioSession>, McpError> {
        if self.shared.status.get() != ConnectionStatus::Connected {
            return Err(McpError::connection(self.server_id(), "not connected"));
        }
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::connection(self.server_id(), "not connected"))
    }

    /// Spawn the process and wire its streams to the background tasks.
    fn spawn(&self) -> Result<Arc<StdioSession>, McpError> {
        let server_id = self.server_id();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        cmd.kill_on_drop(true);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection(server_id, format!("failed to spawn '{}': {e}", self.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection(server_id, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection(server_id, "failed to capture stdout"))?;
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        let session = Arc::new(StdioSession {
            server_id: server_id.to_string(),
            pid: child.id(),
            stdin: Mutex::new(Some(stdin)),
            pending: PendingRequests::new(server_id),
            kill_tx: Mutex::new(Some(kill_tx)),
            monitor: Mutex::new(None),
            stderr_tail: Mutex::new(VecDeque::new()),
            closing: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });

        tracing::info!(
            server = %server_id,
            command = %self.command,
            args = ?self.args,
            pid = ?session.pid,
            "spawned MCP server process"
        );

        tokio::spawn(read_stdout(Arc::downgrade(&session), stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(Arc::downgrade(&session), stderr));
        }
        let monitor = tokio::spawn(monitor_process(
            child,
            kill_rx,
            Arc::clone(&self.shared),
            Arc::downgrade(&session),
        ));
        // Nobody else can hold this lock yet.
        if let Ok(mut slot) = session.monitor.try_lock() {
            *slot = Some(monitor);
        }

        Ok(session)
    }

    /// `initialize` request followed by the `initialized` notification.
    async fn handshake(&self, session: &StdioSession) -> Result<(), McpError> {
        let result = session
            .request(
                "initialize",
                Some(self.settings.initialize_params()),
                self.timeout,
            )
            .await?;
        protocol::parse_initialize(self.server_id(), result)?;
        session.notify("notifications/initialized", None).await
    }
}

impl McpTransport for StdioClient {
    async fn connect(&self) -> Result<(), McpError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() && self.shared.status.get() == ConnectionStatus::Connected {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.shutdown(self.settings.shutdown_timeout()).await;
        }

        let server_id = self.server_id().to_string();
        self.shared.status.set(ConnectionStatus::Connecting);
        *self.shared.tools.lock().await = None;

        let session = match self.spawn() {
            Ok(session) => session,
            Err(e) => {
                self.shared.status.set(ConnectionStatus::Error);
                return Err(e);
            }
        };

        let outcome = tokio::time::timeout(self.timeout, self.handshake(&session)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("initialization failed: {e}")),
            Err(_) => Some(format!(
                "initialization timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        if let Some(reason) = failure {
            let stderr = session.stderr_tail().await;
            if !stderr.is_empty() {
                tracing::warn!(server = %server_id, stderr = %stderr, "server stderr captured on failure");
            }
            session.shutdown(self.settings.shutdown_timeout()).await;
            self.shared.status.set(ConnectionStatus::Error);
            return Err(McpError::connection(
                &server_id,
                format!("{reason}{}", format_stderr_suffix(&stderr)),
            ));
        }

        self.shared.status.set(ConnectionStatus::Connected);
        // The exit monitor may have fired between the handshake and the line
        // above; it only reports closures of connections it saw as connected.
        if session.exited.load(Ordering::SeqCst) {
            self.shared.status.set(ConnectionStatus::Disconnected);
            return Err(McpError::connection(&server_id, PROCESS_EXITED));
        }

        *slot = Some(session);
        tracing::info!(server = %server_id, "stdio MCP server connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.shutdown(self.settings.shutdown_timeout()).await;
            tracing::info!(server = %self.server_id(), "stdio MCP server disconnected");
        }
        *self.shared.tools.lock().await = None;
        self.shared.status.set(ConnectionStatus::Disconnected);
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let session = self.live_session().await?;

        // Held across the request so concurrent callers share one fetch.
        let mut cache = self.shared.tools.lock().await;
        if let Some(tools) = cache.as_ref() {
            return Ok(tools.clone());
        }

        let tools = protocol::list_all_tools(self.server_id(), |params| {
            session.request("tools/list", params, self.timeout)
        })
        .await?;

        tracing::debug!(server = %self.server_id(), count = tools.len(), "cached tool list");
        *cache = Some(tools.clone());
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let session = self.live_session().await?;
        let params = serde_json::to_value(CallToolParams { name, arguments }).map_err(|e| {
            McpError::ToolCall {
                server_id: self.server_id().to_string(),
                tool: name.to_string(),
                reason: format!("failed to serialize arguments: {e}"),
            }
        })?;

        let value = session
            .request("tools/call", Some(params), self.timeout)
            .await
            .map_err(|e| e.into_tool_call_error(self.server_id(), name))?;

        protocol::parse_call_result(self.server_id(), name, value)
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One spawned process and its plumbing.
struct StdioSession {
    server_id: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingRequests,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stderr_tail: Mutex<VecDeque<String>>,
    /// Set by `shutdown`: the exit that follows is intentional.
    closing: AtomicBool,
    /// Set by the exit monitor once the process is gone.
    exited: AtomicBool,
}

impl StdioSession {
    /// Send a request and wait for the matching reply.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(McpError::connection(&self.server_id, PROCESS_EXITED));
        }

        let slot = self.pending.register().await;
        let id = slot.id;
        if let Err(e) = self
            .write_message(&JsonRpcRequest::new(id, method, params))
            .await
        {
            self.pending.remove(id).await;
            return Err(e);
        }

        self.pending.wait(slot, method, timeout).await
    }

    /// Send a notification; no id, no reply.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Serialize one message as a single line on stdin.
    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::Protocol {
            server_id: self.server_id.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::connection(&self.server_id, "stdin is closed"))?;
        stdin.write_all(json.as_bytes()).await.map_err(|e| {
            McpError::connection(&self.server_id, format!("failed to write to stdin: {e}"))
        })?;
        stdin.flush().await.map_err(|e| {
            McpError::connection(&self.server_id, format!("failed to flush stdin: {e}"))
        })
    }

    /// Handle one framed line from stdout.
    async fn dispatch_line(&self, line: &str) {
        match parse_incoming(line) {
            Ok(IncomingMessage::Response(response)) => {
                self.pending.complete(response).await;
            }
            Ok(IncomingMessage::Request { id, method }) => {
                let reply = protocol::server_request_reply(id, &method);
                if let Err(e) = self.write_message(&reply).await {
                    tracing::debug!(server = %self.server_id, error = %e, "failed to answer server request");
                }
            }
            Ok(IncomingMessage::Notification { method }) => {
                tracing::debug!(server = %self.server_id, method = %method, "server notification");
            }
            Err(reason) => {
                tracing::warn!(
                    server = %self.server_id,
                    error = %reason,
                    line = %truncate(line, 200),
                    "dropping malformed line from server stdout"
                );
            }
        }
    }

    /// End the input stream, kill the process and wait for it to be reaped.
    async fn shutdown(&self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);

        // Dropping stdin signals EOF to well-behaved servers.
        self.stdin.lock().await.take();

        if let Some(tx) = self.kill_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.monitor.lock().await.take() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!(server = %self.server_id, "timed out waiting for server process to exit");
            }
        }

        self.pending.fail_all("connection closed").await;
    }

    async fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Pump stdout through the line framer until EOF.
async fn read_stdout(session: Weak<StdioSession>, mut stdout: ChildStdout) {
    let mut framer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "stdout read failed");
                break;
            }
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        for line in framer.push(&chunk[..n]) {
            session.dispatch_line(&line).await;
        }
    }

    if framer.pending_len() > 0 {
        tracing::debug!(bytes = framer.pending_len(), "discarding unterminated stdout tail");
    }
}

/// Log stderr line by line and keep the most recent lines.
///
/// Runs until EOF. Lines that are not valid UTF-8 are logged lossily; the
/// pipe must stay open or a chatty server dies on its next write.
async fn drain_stderr(session: Weak<StdioSession>, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "stderr read failed");
                break;
            }
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        tracing::debug!(server = %session.server_id, "stderr: {line}");
        let mut tail = session.stderr_tail.lock().await;
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Own the child until it exits or a kill is requested, then run the
/// closure path.
///
/// The kill channel also fires when the session is dropped, so a client that
/// is dropped without `disconnect()` still takes its process down.
async fn monitor_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    shared: Arc<StdioShared>,
    session: Weak<StdioSession>,
) {
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %shared.server_id, error = %e, "kill failed");
            }
            "killed".to_string()
        }
    };

    let Some(session) = session.upgrade() else {
        return;
    };
    session.exited.store(true, Ordering::SeqCst);
    if session.closing.load(Ordering::SeqCst) {
        tracing::debug!(server = %shared.server_id, exit = %exit, "server process stopped");
        return;
    }

    // Status first: a caller woken by the failed request must already see
    // the connection as gone.
    let was_connected = shared.status.get() == ConnectionStatus::Connected;
    shared.status.set(ConnectionStatus::Disconnected);
    let failed = session.pending.fail_all(PROCESS_EXITED).await;
    *shared.tools.lock().await = None;

    tracing::warn!(
        server = %shared.server_id,
        exit = %exit,
        failed_requests = failed,
        "MCP server process exited unexpectedly"
    );

    if was_connected {
        if let Some(notifier) = &shared.notifier {
            notifier.notify(PROCESS_EXITED);
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", truncate(stderr.trim(), 2000))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...(truncated)");
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client(command: &str) -> StdioClient {
        StdioClient::new(
            "test",
            command,
            vec![],
            HashMap::new(),
            Duration::from_secs(2),
            ManagerSettings::default(),
            None,
        )
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...(truncated)");
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let c = client("does-not-matter");
        assert_eq!(c.status(), ConnectionStatus::Disconnected);
        assert!(c.process_id().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error_status() {
        let c = client("/nonexistent/mcp-server-binary");
        let err = c.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert!(err.to_string().contains("failed to spawn"));
        assert_eq!(c.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail_with_connection_error() {
        let c = client("does-not-matter");
        assert!(matches!(
            c.list_tools().await.unwrap_err(),
            McpError::Connection { .. }
        ));
        assert!(matches!(
            c.call_tool("echo", serde_json::json!({})).await.unwrap_err(),
            McpError::Connection { .. }
        ));
    }

    #[tokio::test]
    async fn test_double_disconnect_is_harmless() {
        let c = client("does-not-matter");
        c.disconnect().await;
        c.disconnect().await;
        assert_eq!(c.status(), ConnectionStatus::Disconnected);
    }
}
