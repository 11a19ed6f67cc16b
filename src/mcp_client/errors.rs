//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while connecting to or talking with MCP servers.
///
/// Every variant is recoverable from the caller's point of view: the registry
/// surfaces them unchanged and a retry triggers a lazy reconnect.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server is unreachable, the handshake failed, the process died,
    /// or the client is simply not connected.
    #[error("connection to server '{server_id}' failed: {reason}")]
    Connection { server_id: String, reason: String },

    /// A single request exceeded its deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// A tool invocation was rejected after the connection was established.
    #[error("tool '{tool}' on server '{server_id}' failed: {reason}")]
    ToolCall {
        server_id: String,
        tool: String,
        reason: String,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Non-2xx HTTP response from an HTTP-based transport.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A reply arrived but its payload did not have the expected shape.
    #[error("protocol error from server '{server_id}': {reason}")]
    Protocol { server_id: String, reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The persistence collaborator failed.
    #[error("store error: {reason}")]
    Store { reason: String },
}

impl McpError {
    /// Shorthand for [`McpError::Connection`].
    pub fn connection(server_id: &str, reason: impl Into<String>) -> Self {
        McpError::Connection {
            server_id: server_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the channel itself is broken (as opposed to
    /// the server rejecting one request on a healthy channel).
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::Connection { .. } | McpError::Timeout { .. } | McpError::Http { .. }
        )
    }

    /// Re-label a failure of `tools/call` for the caller.
    ///
    /// Transport failures stay as they are so callers can tell a dead server
    /// from a tool that refused its arguments.
    pub fn into_tool_call_error(self, server_id: &str, tool: &str) -> Self {
        match self {
            McpError::Rpc { .. } | McpError::Protocol { .. } => McpError::ToolCall {
                server_id: server_id.to_string(),
                tool: tool.to_string(),
                reason: self.to_string(),
            },
            other => other,
        }
    }
}

impl From<rusqlite::Error> for McpError {
    fn from(e: rusqlite::Error) -> Self {
        McpError::Store {
            reason: e.to_string(),
        }
    }
}
