//! Transport dispatch: one enum variant per configured transport kind.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use super::errors::McpError;
use super::http::{HttpClient, HttpTransportKind};
use super::stdio::StdioClient;
use super::transport::{DisconnectNotifier, McpTransport};
use super::types::{CallToolResult, ConnectionStatus, ServerConfig, TransportConfig, ToolDescriptor};
use crate::config::ManagerSettings;

/// A client for any supported transport.
pub enum McpConnection {
    Stdio(StdioClient),
    Sse(HttpClient),
    StreamableHttp(HttpClient),
}

impl McpConnection {
    /// Build the client matching `config.transport`. Nothing is connected yet.
    pub fn from_config(
        config: &ServerConfig,
        settings: &ManagerSettings,
        notifier: Option<DisconnectNotifier>,
    ) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        match &config.transport {
            TransportConfig::Stdio { command, args, env } => McpConnection::Stdio(StdioClient::new(
                &config.id,
                command,
                args.clone(),
                env.clone(),
                timeout,
                settings.clone(),
                notifier,
            )),
            TransportConfig::Sse { url, headers } => McpConnection::Sse(HttpClient::new(
                &config.id,
                HttpTransportKind::Sse,
                url,
                headers.clone(),
                timeout,
                settings.clone(),
                notifier,
            )),
            TransportConfig::StreamableHttp { url, headers } => {
                McpConnection::StreamableHttp(HttpClient::new(
                    &config.id,
                    HttpTransportKind::StreamableHttp,
                    url,
                    headers.clone(),
                    timeout,
                    settings.clone(),
                    notifier,
                ))
            }
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            McpConnection::Stdio(client) => client.server_id(),
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.server_id()
            }
        }
    }

    /// The transport's wire name.
    pub fn kind(&self) -> &'static str {
        match self {
            McpConnection::Stdio(_) => "stdio",
            McpConnection::Sse(_) => "sse",
            McpConnection::StreamableHttp(_) => "streamable-http",
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        match self {
            McpConnection::Stdio(client) => client.subscribe_status(),
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.subscribe_status()
            }
        }
    }
}

impl McpTransport for McpConnection {
    async fn connect(&self) -> Result<(), McpError> {
        match self {
            McpConnection::Stdio(client) => client.connect().await,
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.connect().await
            }
        }
    }

    async fn disconnect(&self) {
        match self {
            McpConnection::Stdio(client) => client.disconnect().await,
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.disconnect().await
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        match self {
            McpConnection::Stdio(client) => client.list_tools().await,
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.list_tools().await
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        match self {
            McpConnection::Stdio(client) => client.call_tool(name, arguments).await,
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => {
                client.call_tool(name, arguments).await
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        match self {
            McpConnection::Stdio(client) => client.status(),
            McpConnection::Sse(client) | McpConnection::StreamableHttp(client) => client.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(transport: TransportConfig) -> ServerConfig {
        ServerConfig {
            id: "srv".into(),
            name: String::new(),
            transport,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_from_config_picks_variant() {
        let settings = ManagerSettings::default();

        let stdio = McpConnection::from_config(
            &config(TransportConfig::Stdio {
                command: "true".into(),
                args: vec![],
                env: HashMap::new(),
            }),
            &settings,
            None,
        );
        assert!(matches!(stdio, McpConnection::Stdio(_)));
        assert_eq!(stdio.kind(), "stdio");

        let sse = McpConnection::from_config(
            &config(TransportConfig::Sse {
                url: "http://localhost/sse".into(),
                headers: HashMap::new(),
            }),
            &settings,
            None,
        );
        assert_eq!(sse.kind(), "sse");

        let http = McpConnection::from_config(
            &config(TransportConfig::StreamableHttp {
                url: "http://localhost/mcp".into(),
                headers: HashMap::new(),
            }),
            &settings,
            None,
        );
        assert!(matches!(http, McpConnection::StreamableHttp(_)));
        assert_eq!(http.server_id(), "srv");
        assert_eq!(http.status(), ConnectionStatus::Disconnected);
    }
}
