//! Transport contract shared by every connection type.
//!
//! Also holds the two small pieces every client needs to report on itself:
//! an observable status cell and the disconnect event sender bound by the
//! registry.

use std::future::Future;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::errors::McpError;
use super::types::{CallToolResult, ConnectionStatus, ToolDescriptor};

// ─── McpTransport ────────────────────────────────────────────────────────────

/// Capabilities every MCP connection provides, regardless of wire transport.
pub trait McpTransport {
    /// Establish the channel and complete the MCP handshake.
    ///
    /// A no-op when already connected.
    fn connect(&self) -> impl Future<Output = Result<(), McpError>> + Send;

    /// Release the channel. Never fails, even if the channel is already gone.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Tools advertised by the server, cached for the connection's lifetime.
    fn list_tools(&self) -> impl Future<Output = Result<Vec<ToolDescriptor>, McpError>> + Send;

    /// Invoke one tool.
    fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send;

    /// Current lifecycle state.
    fn status(&self) -> ConnectionStatus;
}

// ─── Status Cell ─────────────────────────────────────────────────────────────

/// Lifecycle state owned by one client and observable by anyone holding a
/// receiver.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn set(&self, status: ConnectionStatus) {
        self.tx.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Disconnect Events ───────────────────────────────────────────────────────

/// Emitted by a client that detected the loss of its channel on its own.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub server_id: String,
    /// Identifies the client instance, so a late event from a replaced client
    /// never tears down its successor.
    pub connection_id: String,
    pub reason: String,
}

/// Sender half bound to one client at construction.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    server_id: String,
    connection_id: String,
    tx: mpsc::UnboundedSender<DisconnectEvent>,
}

impl DisconnectNotifier {
    pub fn new(
        server_id: &str,
        connection_id: &str,
        tx: mpsc::UnboundedSender<DisconnectEvent>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            connection_id: connection_id.to_string(),
            tx,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Report the closure. Silently ignored once the registry is gone.
    pub fn notify(&self, reason: &str) {
        let event = DisconnectEvent {
            server_id: self.server_id.clone(),
            connection_id: self.connection_id.clone(),
            reason: reason.to_string(),
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(server = %self.server_id, "disconnect event dropped, registry gone");
        }
    }
}
