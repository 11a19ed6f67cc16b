//! MCP client: transports, connection dispatch and the connection registry.
//!
//! Layers, leaf to root:
//! - `types`, `errors`: wire types, configuration types, error enum
//! - `framing`, `pending`, `sse`, `protocol`: message plumbing shared by the
//!   transports
//! - `stdio`, `http`: the transport clients (`McpTransport` implementors)
//! - `connection`: tagged enum over the transports
//! - `registry`: id → live client table, failure propagation to the store

pub mod connection;
pub mod errors;
pub mod framing;
pub mod heartbeat;
pub mod http;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod stdio;
pub mod transport;
pub mod types;

pub use connection::McpConnection;
pub use errors::McpError;
pub use http::{HttpClient, HttpTransportKind};
pub use registry::McpRegistry;
pub use stdio::StdioClient;
pub use transport::{DisconnectEvent, DisconnectNotifier, McpTransport};
pub use types::{
    CallToolResult, ConnectionStatus, ContentPart, ServerConfig, ToolDescriptor, TransportConfig,
};
