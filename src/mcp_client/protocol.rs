//! MCP method helpers shared by all transports.
//!
//! Each transport supplies a raw "send request, get result" function; these
//! helpers turn raw results into typed values.

use std::future::Future;

use serde_json::Value;

use super::errors::McpError;
use super::types::{
    error_codes, CallToolResult, InitializeResult, ListToolsResult, ToolDescriptor,
};

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 64;

/// Reply to a server-initiated request. Only `ping` is supported; anything
/// else gets method-not-found.
pub fn server_request_reply(id: Value, method: &str) -> Value {
    if method == "ping" {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{method}' is not supported by this client"),
            },
        })
    }
}

/// Parse the `initialize` reply and log who answered.
pub fn parse_initialize(server_id: &str, result: Value) -> Result<InitializeResult, McpError> {
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::Protocol {
            server_id: server_id.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    let info = init.server_info.as_ref();
    tracing::info!(
        server = %server_id,
        remote_name = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
        remote_version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
        protocol = init.protocol_version.as_deref().unwrap_or("unspecified"),
        "MCP handshake complete"
    );
    Ok(init)
}

/// Fetch every tool, following `nextCursor` pagination.
///
/// The first page is requested without params.
pub async fn list_all_tools<F, Fut>(
    server_id: &str,
    mut request: F,
) -> Result<Vec<ToolDescriptor>, McpError>
where
    F: FnMut(Option<Value>) -> Fut,
    Fut: Future<Output = Result<Value, McpError>>,
{
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
        let value = request(params).await?;
        let page: ListToolsResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol {
                server_id: server_id.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(
        server = %server_id,
        pages = MAX_TOOL_PAGES,
        "tools/list pagination limit reached, returning partial list"
    );
    Ok(tools)
}

/// Parse a `tools/call` reply.
pub fn parse_call_result(
    server_id: &str,
    tool: &str,
    value: Value,
) -> Result<CallToolResult, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::ToolCall {
        server_id: server_id.to_string(),
        tool: tool.to_string(),
        reason: format!("malformed tools/call result: {e}"),
    })
}
