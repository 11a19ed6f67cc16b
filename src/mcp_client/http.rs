//! HTTP-based transports: legacy SSE and streamable HTTP.
//!
//! Both wrap a persistent protocol session and add a heartbeat on top, since
//! neither reliably reports a half-open connection. Any of these ends the
//! connection through one closure path (run at most once per connection):
//! - heartbeat failure budget spent
//! - SSE event stream closed or errored
//! - a transport-level failure on a regular call

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClientInner, Response, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::heartbeat::Heartbeat;
use super::pending::PendingRequests;
use super::protocol;
use super::sse::{sse_events, SseEvent};
use super::transport::{DisconnectNotifier, McpTransport, StatusCell};
use super::types::{
    parse_incoming, CallToolParams, CallToolResult, ConnectionStatus, IncomingMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolDescriptor,
};
use crate::config::ManagerSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session header of the streamable HTTP transport.
const SESSION_HEADER: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";

// ─── HttpClient ──────────────────────────────────────────────────────────────

/// Which HTTP session flavor a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpTransportKind {
    Sse,
    StreamableHttp,
}

/// Client for one MCP server reached over HTTP.
pub struct HttpClient {
    shared: Arc<HttpShared>,
    kind: HttpTransportKind,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    settings: ManagerSettings,
    /// Serializes connect/disconnect.
    lifecycle: Mutex<()>,
}

struct HttpShared {
    server_id: String,
    status: StatusCell,
    tools: Mutex<Option<Vec<ToolDescriptor>>>,
    notifier: Option<DisconnectNotifier>,
    session: Mutex<Option<Arc<HttpSession>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    /// Bumped on every connect attempt; closure reports from an older
    /// session are ignored.
    generation: AtomicU64,
}

impl HttpClient {
    pub fn new(
        server_id: &str,
        kind: HttpTransportKind,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        settings: ManagerSettings,
        notifier: Option<DisconnectNotifier>,
    ) -> Self {
        Self {
            shared: Arc::new(HttpShared {
                server_id: server_id.to_string(),
                status: StatusCell::new(),
                tools: Mutex::new(None),
                notifier,
                session: Mutex::new(None),
                heartbeat: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            kind,
            url: url.to_string(),
            headers,
            timeout,
            settings,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn kind(&self) -> HttpTransportKind {
        self.kind
    }

    /// Watch the lifecycle state.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Send a raw request on the live connection.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let (generation, session) = self.live_session().await?;
        self.checked(generation, session.request(method, params, self.timeout).await)
            .await
    }

    async fn live_session(&self) -> Result<(u64, Arc<HttpSession>), McpError> {
        if self.shared.status.get() != ConnectionStatus::Connected {
            return Err(McpError::connection(self.server_id(), "not connected"));
        }
        let slot = self.shared.session.lock().await;
        let session = slot
            .clone()
            .ok_or_else(|| McpError::connection(self.server_id(), "not connected"))?;
        Ok((self.shared.generation.load(Ordering::SeqCst), session))
    }

    /// A failed call is the main breakage signal on these transports: run the
    /// closure path before handing the error back.
    async fn checked<T>(&self, generation: u64, outcome: Result<T, McpError>) -> Result<T, McpError> {
        if let Err(e) = &outcome {
            if e.is_transport_failure() {
                self.shared.handle_closed(generation, &e.to_string()).await;
            }
        }
        outcome
    }

    /// Open the session and run the MCP handshake.
    /// Open the transport session. No MCP traffic yet.
    async fn open_session(&self, generation: u64) -> Result<Arc<HttpSession>, McpError> {
        let server_id = self.server_id();
        let headers = build_headers(server_id, &self.headers)?;
        let http = HttpClientInner::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                McpError::connection(server_id, format!("failed to build HTTP client: {e}"))
            })?;

        let session = match self.kind {
            HttpTransportKind::Sse => {
                let on_closed = closure_callback(Arc::downgrade(&self.shared), generation);
                HttpSession::Sse(SseSession::open(server_id, http, &self.url, headers, on_closed).await?)
            }
            HttpTransportKind::StreamableHttp => {
                HttpSession::Streamable(StreamableSession::new(server_id, http, &self.url, headers)?)
            }
        };
        Ok(Arc::new(session))
    }

    /// `initialize` followed by `notifications/initialized`.
    async fn handshake(&self, session: &HttpSession) -> Result<(), McpError> {
        let result = session
            .request(
                "initialize",
                Some(self.settings.initialize_params()),
                self.timeout,
            )
            .await?;
        protocol::parse_initialize(self.server_id(), result)?;
        session
            .notify("notifications/initialized", None, self.timeout)
            .await
    }

    fn start_heartbeat(&self, generation: u64, session: Arc<HttpSession>) -> Heartbeat {
        let timeout = self.timeout;
        Heartbeat::spawn(
            self.server_id(),
            self.settings.heartbeat_interval(),
            self.settings.heartbeat_max_failures,
            move || {
                let session = Arc::clone(&session);
                async move { session.request("ping", None, timeout).await.map(|_| ()) }
            },
            closure_callback(Arc::downgrade(&self.shared), generation),
        )
    }
}

impl McpTransport for HttpClient {
    async fn connect(&self) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shared.status.get() == ConnectionStatus::Connected
            && self.shared.session.lock().await.is_some()
        {
            return Ok(());
        }

        self.shared.teardown().await;
        let server_id = self.server_id().to_string();
        self.shared.status.set(ConnectionStatus::Connecting);
        *self.shared.tools.lock().await = None;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let timed_out = || {
            format!(
                "initialization timed out after {}ms",
                self.timeout.as_millis()
            )
        };

        let session = match tokio::time::timeout_at(deadline, self.open_session(generation)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.shared.status.set(ConnectionStatus::Error);
                return Err(McpError::connection(
                    &server_id,
                    format!("initialization failed: {e}"),
                ));
            }
            Err(_) => {
                self.shared.status.set(ConnectionStatus::Error);
                return Err(McpError::connection(&server_id, timed_out()));
            }
        };

        let handshake = match tokio::time::timeout_at(deadline, self.handshake(&session)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("initialization failed: {e}")),
            Err(_) => Err(timed_out()),
        };
        if let Err(reason) = handshake {
            // The server may already hold a session for us.
            session.close().await;
            self.shared.status.set(ConnectionStatus::Error);
            return Err(McpError::connection(&server_id, reason));
        }

        {
            let mut slot = self.shared.session.lock().await;
            *slot = Some(Arc::clone(&session));
            *self.shared.heartbeat.lock().await =
                Some(self.start_heartbeat(generation, Arc::clone(&session)));
            self.shared.status.set(ConnectionStatus::Connected);
        }

        // The stream may have dropped while the slot was still empty.
        if session.is_closed() {
            self.shared
                .handle_closed(generation, "event stream closed during connect")
                .await;
            return Err(McpError::connection(&server_id, "event stream closed"));
        }

        tracing::info!(server = %server_id, url = %self.url, kind = ?self.kind, "HTTP MCP server connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shared.teardown().await {
            tracing::info!(server = %self.server_id(), "HTTP MCP server disconnected");
        }
        *self.shared.tools.lock().await = None;
        self.shared.status.set(ConnectionStatus::Disconnected);
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let (generation, session) = self.live_session().await?;

        let mut cache = self.shared.tools.lock().await;
        if let Some(tools) = cache.as_ref() {
            return Ok(tools.clone());
        }

        let fetched = protocol::list_all_tools(self.server_id(), |params| {
            session.request("tools/list", params, self.timeout)
        })
        .await;
        if let Ok(tools) = &fetched {
            *cache = Some(tools.clone());
        }
        // The closure path clears the cache; release it first.
        drop(cache);
        self.checked(generation, fetched).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let (generation, session) = self.live_session().await?;
        let params = serde_json::to_value(CallToolParams { name, arguments }).map_err(|e| {
            McpError::ToolCall {
                server_id: self.server_id().to_string(),
                tool: name.to_string(),
                reason: format!("failed to serialize arguments: {e}"),
            }
        })?;

        let outcome = session
            .request("tools/call", Some(params), self.timeout)
            .await;
        let value = self
            .checked(generation, outcome)
            .await
            .map_err(|e| e.into_tool_call_error(self.server_id(), name))?;

        protocol::parse_call_result(self.server_id(), name, value)
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }
}

impl HttpShared {
    /// Drop the current session. Heartbeat first, then the session itself.
    /// Returns whether there was anything to tear down.
    async fn teardown(&self) -> bool {
        let session = self.session.lock().await.take();
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.stop();
        }
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Closure path for a connection that broke on its own.
    async fn handle_closed(&self, generation: u64, reason: &str) {
        let session = {
            let mut slot = self.session.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let Some(session) = slot.take() else {
                return;
            };
            if let Some(heartbeat) = self.heartbeat.lock().await.take() {
                heartbeat.stop();
            }
            self.status.set(ConnectionStatus::Disconnected);
            session
        };

        session.close().await;
        *self.tools.lock().await = None;

        tracing::warn!(server = %self.server_id, reason = %reason, "HTTP MCP connection lost");
        if let Some(notifier) = &self.notifier {
            notifier.notify(reason);
        }
    }
}

/// Callback used by background tasks to report a closure.
///
/// Spawns the closure path rather than running it inline, because the path
/// stops the very task that reports.
fn closure_callback(shared: Weak<HttpShared>, generation: u64) -> impl FnOnce(String) + Send + 'static {
    move |reason: String| {
        if let Some(shared) = shared.upgrade() {
            tokio::spawn(async move {
                shared.handle_closed(generation, &reason).await;
            });
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

enum HttpSession {
    Sse(SseSession),
    Streamable(StreamableSession),
}

impl HttpSession {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        match self {
            HttpSession::Sse(session) => session.request(method, params, timeout).await,
            HttpSession::Streamable(session) => session.request(method, params, timeout).await,
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), McpError> {
        match self {
            HttpSession::Sse(session) => session.notify(method, params, timeout).await,
            HttpSession::Streamable(session) => session.notify(method, params, timeout).await,
        }
    }

    async fn close(&self) {
        match self {
            HttpSession::Sse(session) => session.close().await,
            HttpSession::Streamable(session) => session.close().await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            HttpSession::Sse(session) => session.reader.is_finished(),
            HttpSession::Streamable(_) => false,
        }
    }
}

// ─── Legacy SSE ──────────────────────────────────────────────────────────────

/// GET event stream for replies, POST endpoint for requests.
struct SseSession {
    server_id: String,
    http: HttpClientInner,
    headers: HeaderMap,
    post_url: Url,
    pending: Arc<PendingRequests>,
    reader: JoinHandle<()>,
}

impl SseSession {
    /// Open the event stream and wait for the `endpoint` event.
    async fn open<F>(
        server_id: &str,
        http: HttpClientInner,
        url: &str,
        headers: HeaderMap,
        on_closed: F,
    ) -> Result<Self, McpError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let base = Url::parse(url)
            .map_err(|e| McpError::connection(server_id, format!("invalid url '{url}': {e}")))?;

        let response = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| send_error(server_id, e))?;
        let response = ensure_success(response).await?;

        let mut events = Box::pin(sse_events(response));
        let post_url = loop {
            match events.next().await {
                Some(Ok(event)) if event.event == "endpoint" => {
                    break base.join(event.data.trim()).map_err(|e| {
                        McpError::connection(server_id, format!("invalid endpoint event: {e}"))
                    })?;
                }
                Some(Ok(event)) => {
                    tracing::debug!(server = %server_id, event = %event.event, "ignoring event before endpoint");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(McpError::connection(
                        server_id,
                        "event stream ended before endpoint event",
                    ))
                }
            }
        };

        let pending = Arc::new(PendingRequests::new(server_id));
        let reader = tokio::spawn(read_events(
            server_id.to_string(),
            events,
            Arc::clone(&pending),
            ReplyPoster {
                http: http.clone(),
                url: post_url.clone(),
                headers: headers.clone(),
            },
            on_closed,
        ));

        tracing::debug!(server = %server_id, endpoint = %post_url, "SSE session open");
        Ok(Self {
            server_id: server_id.to_string(),
            http,
            headers,
            post_url,
            pending,
            reader,
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if self.reader.is_finished() {
            return Err(McpError::connection(&self.server_id, "event stream closed"));
        }
        let slot = self.pending.register().await;
        let id = slot.id;
        let posted = tokio::time::timeout(
            timeout,
            self.post(&JsonRpcRequest::new(id, method, params)),
        )
        .await;
        match posted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(id).await;
                return Err(e);
            }
            Err(_) => {
                self.pending.remove(id).await;
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        self.pending.wait(slot, method, timeout).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), McpError> {
        tokio::time::timeout(timeout, self.post(&JsonRpcNotification::new(method, params)))
            .await
            .map_err(|_| McpError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn post<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| send_error(&self.server_id, e))?;
        ensure_success(response).await.map(|_| ())
    }

    async fn close(&self) {
        self.reader.abort();
        self.pending.fail_all("connection closed").await;
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Posts answers to server-initiated requests from the reader task.
struct ReplyPoster {
    http: HttpClientInner,
    url: Url,
    headers: HeaderMap,
}

/// Route events from the SSE stream until it ends.
async fn read_events<S, F>(
    server_id: String,
    mut events: S,
    pending: Arc<PendingRequests>,
    poster: ReplyPoster,
    on_closed: F,
) where
    S: futures::Stream<Item = Result<SseEvent, McpError>> + Unpin,
    F: FnOnce(String),
{
    let reason = loop {
        match events.next().await {
            Some(Ok(event)) if event.event == "message" => match parse_incoming(&event.data) {
                Ok(IncomingMessage::Response(response)) => {
                    pending.complete(response).await;
                }
                Ok(IncomingMessage::Request { id, method }) => {
                    let reply = protocol::server_request_reply(id, &method);
                    let sent = poster
                        .http
                        .post(poster.url.clone())
                        .headers(poster.headers.clone())
                        .json(&reply)
                        .send()
                        .await;
                    if let Err(e) = sent {
                        tracing::debug!(server = %server_id, error = %e, "failed to answer server request");
                    }
                }
                Ok(IncomingMessage::Notification { method }) => {
                    tracing::debug!(server = %server_id, method = %method, "server notification");
                }
                Err(reason) => {
                    tracing::warn!(server = %server_id, error = %reason, "dropping malformed SSE message");
                }
            },
            Some(Ok(event)) => {
                tracing::debug!(server = %server_id, event = %event.event, "ignoring SSE event");
            }
            Some(Err(e)) => break format!("event stream error: {e}"),
            None => break "event stream closed".to_string(),
        }
    };

    pending.fail_all(&reason).await;
    on_closed(reason);
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// One POST per message; replies come back as JSON or as an SSE body.
struct StreamableSession {
    server_id: String,
    http: HttpClientInner,
    url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl StreamableSession {
    fn new(
        server_id: &str,
        http: HttpClientInner,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Self, McpError> {
        let url = Url::parse(url)
            .map_err(|e| McpError::connection(server_id, format!("invalid url '{url}': {e}")))?;
        Ok(Self {
            server_id: server_id.to_string(),
            http,
            url,
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exchange = async {
            let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;
            self.read_reply(id, response).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| McpError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), McpError> {
        tokio::time::timeout(timeout, self.post(&JsonRpcNotification::new(method, params)))
            .await
            .map_err(|_| McpError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map(|_| ())
    }

    async fn post<T: Serialize>(&self, message: &T) -> Result<Response, McpError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, format!("application/json, {EVENT_STREAM}"))
            .json(message);
        if let Some(session_id) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| send_error(&self.server_id, e))?;
        let response = ensure_success(response).await?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session_id.to_string());
        }
        Ok(response)
    }

    /// Extract the reply to request `id` from a JSON or SSE body.
    async fn read_reply(&self, id: u64, response: Response) -> Result<Value, McpError> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(EVENT_STREAM));

        if is_stream {
            let mut events = Box::pin(sse_events(response));
            while let Some(event) = events.next().await {
                let event = event?;
                if event.event != "message" {
                    continue;
                }
                match parse_incoming(&event.data) {
                    Ok(IncomingMessage::Response(reply)) if reply.id == id => {
                        return reply.into_result();
                    }
                    Ok(other) => {
                        tracing::debug!(server = %self.server_id, incoming = ?other, "skipping unrelated message in reply stream");
                    }
                    Err(reason) => {
                        tracing::warn!(server = %self.server_id, error = %reason, "dropping malformed SSE message");
                    }
                }
            }
            return Err(McpError::connection(
                &self.server_id,
                "reply stream ended without a response",
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| send_error(&self.server_id, e))?;
        let reply: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| McpError::Protocol {
                server_id: self.server_id.clone(),
                reason: format!("invalid JSON-RPC reply: {e}"),
            })?;
        if reply.id != id {
            return Err(McpError::Protocol {
                server_id: self.server_id.clone(),
                reason: format!("reply id {} does not match request id {id}", reply.id),
            });
        }
        reply.into_result()
    }

    /// Best-effort session termination.
    async fn close(&self) {
        let Some(session_id) = self.session_id.lock().await.take() else {
            return;
        };
        let sent = self
            .http
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session_id)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Err(e) = sent {
            tracing::debug!(server = %self.server_id, error = %e, "session DELETE failed");
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Convert configured header pairs, rejecting invalid names or values.
fn build_headers(server_id: &str, headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::Config {
            reason: format!("server '{server_id}': invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::Config {
            reason: format!("server '{server_id}': invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

fn send_error(server_id: &str, e: reqwest::Error) -> McpError {
    McpError::connection(server_id, format!("HTTP request failed: {e}"))
}

/// Map a non-2xx response to [`McpError::Http`].
async fn ensure_success(response: Response) -> Result<Response, McpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(McpError::Http {
        status: status.as_u16(),
        body,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
