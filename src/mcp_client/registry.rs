//! Connection registry: one live client per server id.
//!
//! The registry is an explicit context object. Build it once at startup with
//! [`McpRegistry::new`] and hand the `Arc` to whoever needs tools.
//!
//! Clients report self-detected closures on an event channel. The registry's
//! event task drops the matching entry and records the new status in the
//! store; a client never touches persisted state itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::McpConnection;
use super::errors::McpError;
use super::transport::{DisconnectEvent, DisconnectNotifier, McpTransport};
use super::types::{CallToolResult, ConnectionStatus, ServerConfig, ToolDescriptor};
use crate::config::ManagerSettings;
use crate::store::ServerStore;

// ─── Registry Entry ──────────────────────────────────────────────────────────

#[derive(Clone)]
struct RegistryEntry {
    /// Unique per constructed client; stale events are matched against it.
    connection_id: String,
    client: Arc<McpConnection>,
}

// ─── McpRegistry ─────────────────────────────────────────────────────────────

pub struct McpRegistry {
    store: Arc<dyn ServerStore>,
    settings: ManagerSettings,
    clients: RwLock<HashMap<String, RegistryEntry>>,
    /// Serializes connect/disconnect per server id.
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events_tx: mpsc::UnboundedSender<DisconnectEvent>,
    event_task: JoinHandle<()>,
}

impl McpRegistry {
    /// Create the registry and start its disconnect-event task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn ServerStore>, settings: ManagerSettings) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak: &Weak<McpRegistry>| Self {
            store,
            settings,
            clients: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            events_tx,
            event_task: tokio::spawn(run_event_loop(weak.clone(), events_rx)),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Ensure `id` has a connected client.
    ///
    /// Returns immediately when one exists. Otherwise the configuration is
    /// read from the store and a fresh client is built and connected. On
    /// failure nothing is stored and the error is returned unchanged.
    pub async fn connect(&self, id: &str) -> Result<(), McpError> {
        self.ensure_connected(id).await.map(|_| ())
    }

    /// Disconnect `id` and forget it. No-op when absent.
    pub async fn disconnect(&self, id: &str) {
        let lock = self.connect_lock(id).await;
        let _guard = lock.lock().await;

        let entry = self.clients.write().await.remove(id);
        let Some(entry) = entry else {
            return;
        };
        entry.client.disconnect().await;
        self.record_status(id, ConnectionStatus::Disconnected).await;
        tracing::info!(server = %id, "MCP server disconnected");
    }

    /// Tools of `id`, connecting first if needed.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let client = self.ensure_connected(id).await?;
        client.list_tools().await
    }

    /// Invoke `name` on `id`, connecting first if needed.
    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let client = self.ensure_connected(id).await?;
        let start = std::time::Instant::now();
        let result = client.call_tool(name, arguments).await;
        tracing::debug!(
            server = %id,
            tool = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "tool call finished"
        );
        result
    }

    /// Live status of `id`; `Disconnected` when there is no entry.
    pub async fn get_status(&self, id: &str) -> ConnectionStatus {
        self.clients
            .read()
            .await
            .get(id)
            .map(|entry| entry.client.status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// The client currently registered for `id`.
    pub async fn client(&self, id: &str) -> Option<Arc<McpConnection>> {
        self.clients
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.client))
    }

    /// Disconnect every client concurrently, then drop their entries.
    ///
    /// Persisted status is left as is, so [`restore_connections`] picks the
    /// same servers up on the next start.
    ///
    /// [`restore_connections`]: McpRegistry::restore_connections
    pub async fn disconnect_all(&self) {
        let entries: Vec<(String, RegistryEntry)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        if entries.is_empty() {
            return;
        }

        tracing::info!(count = entries.len(), "disconnecting all MCP servers");
        join_all(entries.iter().map(|(_, entry)| entry.client.disconnect())).await;

        let mut clients = self.clients.write().await;
        for (id, entry) in &entries {
            let same = clients
                .get(id)
                .is_some_and(|current| current.connection_id == entry.connection_id);
            if same {
                clients.remove(id);
            }
        }
    }

    /// Ids whose client is currently connected, sorted.
    pub async fn get_connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.client.status() == ConnectionStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Reconnect every server the store last saw as connected.
    ///
    /// Servers connect concurrently. Failures are logged and returned, never
    /// fatal.
    pub async fn restore_connections(&self) -> Vec<(String, Result<(), McpError>)> {
        let store = Arc::clone(&self.store);
        let ids = match tokio::task::spawn_blocking(move || {
            store.find_ids_by_status(ConnectionStatus::Connected)
        })
        .await
        {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to read servers to restore");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "restore lookup task failed");
                return Vec::new();
            }
        };

        if ids.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = ids.len(), "restoring MCP connections");

        join_all(ids.into_iter().map(|id| async move {
            let outcome = self.connect(&id).await;
            if let Err(e) = &outcome {
                tracing::warn!(server = %id, error = %e, "failed to restore MCP connection");
            }
            (id, outcome)
        }))
        .await
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn live_client(&self, id: &str) -> Option<Arc<McpConnection>> {
        self.clients
            .read()
            .await
            .get(id)
            .filter(|entry| entry.client.status() == ConnectionStatus::Connected)
            .map(|entry| Arc::clone(&entry.client))
    }

    async fn ensure_connected(&self, id: &str) -> Result<Arc<McpConnection>, McpError> {
        if let Some(client) = self.live_client(id).await {
            return Ok(client);
        }

        let lock = self.connect_lock(id).await;
        let _guard = lock.lock().await;

        // Another caller may have finished connecting while we waited.
        if let Some(client) = self.live_client(id).await {
            return Ok(client);
        }

        let config = self.load_config(id).await?;

        let stale = self.clients.write().await.remove(id);
        if let Some(stale) = stale {
            tracing::debug!(server = %id, "replacing stale client");
            stale.client.disconnect().await;
        }

        let connection_id = Uuid::new_v4().to_string();
        let notifier = DisconnectNotifier::new(id, &connection_id, self.events_tx.clone());
        let client = Arc::new(McpConnection::from_config(
            &config,
            &self.settings,
            Some(notifier),
        ));

        tracing::info!(
            server = %id,
            name = %config.display_name(),
            transport = client.kind(),
            "connecting MCP server"
        );

        if let Err(e) = client.connect().await {
            tracing::error!(server = %id, error = %e, "MCP server connection failed");
            client.disconnect().await;
            self.record_status(id, ConnectionStatus::Error).await;
            return Err(e);
        }

        self.clients.write().await.insert(
            id.to_string(),
            RegistryEntry {
                connection_id,
                client: Arc::clone(&client),
            },
        );
        self.record_status(id, ConnectionStatus::Connected).await;
        Ok(client)
    }

    async fn connect_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    async fn load_config(&self, id: &str) -> Result<ServerConfig, McpError> {
        let store = Arc::clone(&self.store);
        let key = id.to_string();
        let found = tokio::task::spawn_blocking(move || store.find_config(&key))
            .await
            .map_err(|e| McpError::Store {
                reason: format!("config lookup task failed: {e}"),
            })??;

        found.ok_or_else(|| McpError::connection(id, "unknown server id"))
    }

    /// Best-effort status write; failures are logged only.
    async fn record_status(&self, id: &str, status: ConnectionStatus) {
        let store = Arc::clone(&self.store);
        let key = id.to_string();
        match tokio::task::spawn_blocking(move || store.set_status(&key, status)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(server = %id, status = %status, error = %e, "failed to record server status");
            }
            Err(e) => {
                tracing::warn!(server = %id, status = %status, error = %e, "status update task failed");
            }
        }
    }

    /// Drop the entry named by `event` if it still belongs to the reporting
    /// client, then mark the server disconnected in the store.
    async fn handle_disconnected(&self, event: DisconnectEvent) {
        let removed = {
            let mut clients = self.clients.write().await;
            let current = clients
                .get(&event.server_id)
                .is_some_and(|entry| entry.connection_id == event.connection_id);
            if current {
                clients.remove(&event.server_id)
            } else {
                None
            }
        };

        if removed.is_none() {
            tracing::debug!(
                server = %event.server_id,
                connection_id = %event.connection_id,
                "ignoring disconnect event from a replaced client"
            );
            return;
        }

        tracing::warn!(server = %event.server_id, reason = %event.reason, "MCP server disconnected unexpectedly");
        self.record_status(&event.server_id, ConnectionStatus::Disconnected)
            .await;
    }
}

impl Drop for McpRegistry {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

async fn run_event_loop(
    registry: Weak<McpRegistry>,
    mut events: mpsc::UnboundedReceiver<DisconnectEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_disconnected(event).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
