//! mcp-bridge: connection manager for Model Context Protocol tool servers.
//!
//! Servers are reached over stdio (child process), legacy SSE or streamable
//! HTTP. [`McpRegistry`] keeps one live client per configured server, connects
//! lazily, and marks servers disconnected in the [`store::ServerStore`] when a
//! client reports that its channel went away.

pub mod config;
pub mod logging;
pub mod mcp_client;
pub mod store;

pub use config::{BridgeConfig, ManagerSettings};
pub use mcp_client::{McpError, McpRegistry, McpTransport};
pub use store::{ServerStore, SqliteServerStore};
