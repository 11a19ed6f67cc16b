//! Bridge configuration loading.
//!
//! Reads `mcp-bridge.yaml` (JSON is accepted too, it is a YAML subset) and
//! resolves environment variables before parsing, so secrets such as
//! `Authorization: "Bearer ${GITHUB_TOKEN}"` never need to live in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{ServerConfig, PROTOCOL_VERSION};

/// Environment variable overriding the data directory.
pub const HOME_ENV_VAR: &str = "MCP_BRIDGE_HOME";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Tunables shared by every connection the registry creates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Interval between liveness probes on HTTP transports.
    pub heartbeat_interval_ms: u64,
    /// Consecutive failed probes tolerated before the connection is dropped.
    pub heartbeat_max_failures: u32,
    /// How long a disconnect waits for a killed process to be reaped.
    pub shutdown_timeout_secs: u64,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_max_failures: 1,
            shutdown_timeout_secs: 5,
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ManagerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Parameters of the `initialize` request.
    pub fn initialize_params(&self) -> serde_json::Value {
        serde_json::json!({
            "protocolVersion": self.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version,
            },
        })
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub settings: ManagerSettings,
    /// Servers to seed into the store on startup.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse the bridge configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing. Duplicate server ids are rejected.
pub fn load_config(path: &Path) -> Result<BridgeConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse configuration text (after env-var interpolation).
pub fn parse_config(raw: &str) -> Result<BridgeConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let config: BridgeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::Config {
            reason: format!("failed to parse config: {e}"),
        })?;

    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        if server.id.trim().is_empty() {
            return Err(McpError::Config {
                reason: "server entry with empty id".into(),
            });
        }
        if !seen.insert(server.id.as_str()) {
            return Err(McpError::Config {
                reason: format!("duplicate server id '{}'", server.id),
            });
        }
    }

    Ok(config)
}

/// Platform data directory for the bridge (`<data_dir>/mcp-bridge`).
///
/// `MCP_BRIDGE_HOME` wins when set. Falls back to `~/.mcp-bridge/` only if no
/// platform directory can be resolved.
pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV_VAR) {
        if !home.trim().is_empty() {
            return PathBuf::from(expand_tilde(&home));
        }
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-bridge")
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
