//! Persistence collaborator for server configuration and last-known status.
//!
//! The registry only reads configuration and writes status; it never treats
//! the store as the source of truth for what is live right now.

pub mod sqlite;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{ConnectionStatus, ServerConfig};

pub use sqlite::SqliteServerStore;

/// Storage for [`ServerConfig`] rows and their persisted status.
///
/// Calls are synchronous; async callers should move them off the runtime
/// with `spawn_blocking` when latency matters.
pub trait ServerStore: Send + Sync {
    /// Configuration for `id`, if known.
    fn find_config(&self, id: &str) -> Result<Option<ServerConfig>, McpError>;

    /// Record the last-known status of `id`.
    fn set_status(&self, id: &str, status: ConnectionStatus) -> Result<(), McpError>;

    /// Ids whose persisted status equals `status`, sorted.
    fn find_ids_by_status(&self, status: ConnectionStatus) -> Result<Vec<String>, McpError>;

    /// Insert or replace a configuration. Existing status is kept.
    fn upsert_config(&self, config: &ServerConfig) -> Result<(), McpError>;
}
