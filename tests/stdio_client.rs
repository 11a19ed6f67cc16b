use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use mcp_bridge::config::ManagerSettings;
use mcp_bridge::mcp_client::types::PROTOCOL_VERSION;
use mcp_bridge::mcp_client::{
    ConnectionStatus, DisconnectEvent, DisconnectNotifier, McpError, McpTransport, StdioClient,
};

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_echo-mcp-server");

fn echo_client(env: &[(&str, &str)], timeout: Duration) -> StdioClient {
    echo_client_with_notifier(env, timeout, None)
}

fn echo_client_with_notifier(
    env: &[(&str, &str)],
    timeout: Duration,
    notifier: Option<DisconnectNotifier>,
) -> StdioClient {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    StdioClient::new(
        "echo",
        ECHO_SERVER,
        vec![],
        env,
        timeout,
        ManagerSettings::default(),
        notifier,
    )
}

fn notifier() -> (DisconnectNotifier, mpsc::UnboundedReceiver<DisconnectEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DisconnectNotifier::new("echo", "conn-1", tx), rx)
}

async fn wait_for_status(client: &StdioClient, want: ConnectionStatus) {
    let mut rx = client.subscribe_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("status did not change in time")
        .expect("status channel closed");
}

#[tokio::test]
async fn test_connect_list_and_call() {
    let client = echo_client(&[], Duration::from_secs(10));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);

    client.connect().await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);
    // Already connected: no-op.
    client.connect().await.unwrap();

    let tools = client.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"echo"));
    assert!(names.contains(&"crash"));

    let result = client
        .call_tool("echo", json!({ "text": "hello" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "hello");
    assert!(!result.is_error);

    client.disconnect().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_their_own_replies() {
    let client = echo_client(&[], Duration::from_secs(10));
    client.connect().await.unwrap();

    let (slow, fast) = tokio::join!(
        client.call_tool("sleep", json!({ "ms": 300 })),
        client.call_tool("echo", json!({ "text": "fast" })),
    );
    assert_eq!(slow.unwrap().text(), "slept 300ms");
    assert_eq!(fast.unwrap().text(), "fast");
    assert_eq!(client.pending_requests().await, 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_timeout_frees_slot_and_discards_late_reply() {
    let client = echo_client(&[], Duration::from_secs(1));
    client.connect().await.unwrap();

    let err = client
        .call_tool("sleep", json!({ "ms": 1500 }))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout { ref method, .. } if method == "tools/call"));
    assert_eq!(client.pending_requests().await, 0);

    // The late reply arrives while this call is outstanding and must not
    // resolve it.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let result = client
        .call_tool("echo", json!({ "text": "after" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "after");
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_rejected_call_is_tool_call_error() {
    let client = echo_client(&[], Duration::from_secs(10));
    client.connect().await.unwrap();

    let err = client
        .call_tool("fail", json!({ "message": "nope" }))
        .await
        .unwrap_err();
    match err {
        McpError::ToolCall {
            server_id, tool, reason,
        } => {
            assert_eq!(server_id, "echo");
            assert_eq!(tool, "fail");
            assert!(reason.contains("nope"));
        }
        other => panic!("expected ToolCall, got {other:?}"),
    }
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_process_exit_rejects_every_pending_request() {
    let (notifier, mut events) = notifier();
    let client = Arc::new(echo_client_with_notifier(
        &[],
        Duration::from_secs(10),
        Some(notifier),
    ));
    client.connect().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        waiters.push(tokio::spawn(async move {
            client.call_tool("sleep", json!({ "ms": 5000 })).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.pending_requests().await, 3);

    let crash = client.call_tool("crash", json!({})).await.unwrap_err();
    assert!(matches!(crash, McpError::Connection { .. }));

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(
            matches!(err, McpError::Connection { ref reason, .. } if reason.contains("exited")),
            "unexpected error: {err:?}"
        );
    }

    wait_for_status(&client, ConnectionStatus::Disconnected).await;
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.server_id, "echo");
    assert_eq!(event.connection_id, "conn-1");
    assert!(events.try_recv().is_err());

    let err = client.list_tools().await.unwrap_err();
    assert!(matches!(err, McpError::Connection { .. }));
}

#[tokio::test]
async fn test_list_tools_is_cached() {
    let client = echo_client(&[], Duration::from_secs(10));
    client.connect().await.unwrap();

    let first = client.list_tools().await.unwrap();
    let second = client.list_tools().await.unwrap();
    assert_eq!(first, second);

    let count = client.call_tool("list_count", json!({})).await.unwrap();
    assert_eq!(count.text(), "1");

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_invalidates_tool_cache() {
    let client = echo_client(&[], Duration::from_secs(10));
    client.connect().await.unwrap();
    client.list_tools().await.unwrap();
    client.disconnect().await;

    client.connect().await.unwrap();
    client.list_tools().await.unwrap();
    // Fresh process, fresh cache: exactly one listing on the new server.
    let count = client.call_tool("list_count", json!({})).await.unwrap();
    assert_eq!(count.text(), "1");

    client.disconnect().await;
}

#[tokio::test]
async fn test_paginated_tool_list_is_collected() {
    let client = echo_client(&[("ECHO_MCP_PAGE_SIZE", "2")], Duration::from_secs(10));
    client.connect().await.unwrap();

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 5);
    let count = client.call_tool("list_count", json!({})).await.unwrap();
    assert_eq!(count.text(), "3");

    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_stdout_lines_are_skipped() {
    let client = echo_client(&[("ECHO_MCP_NOISE", "1")], Duration::from_secs(10));
    client.connect().await.unwrap();

    let result = client
        .call_tool("echo", json!({ "text": "still works" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "still works");
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_handshake_timeout_kills_process() {
    let client = echo_client(&[("ECHO_MCP_INIT_DELAY_MS", "5000")], Duration::from_secs(1));

    let err = client.connect().await.unwrap_err();
    assert!(
        matches!(err, McpError::Connection { ref reason, .. } if reason.contains("timed out")),
        "unexpected error: {err:?}"
    );
    assert_eq!(client.status(), ConnectionStatus::Error);
    assert_eq!(client.process_id().await, None);
}

#[tokio::test]
async fn test_spawn_failure_is_connection_error() {
    let client = StdioClient::new(
        "missing",
        "mcp-bridge-test-no-such-binary",
        vec![],
        HashMap::new(),
        Duration::from_secs(1),
        ManagerSettings::default(),
        None,
    );
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, McpError::Connection { ref server_id, .. } if server_id == "missing"));
    assert_eq!(client.status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_silent() {
    let (notifier, mut events) = notifier();
    let client = echo_client_with_notifier(&[], Duration::from_secs(10), Some(notifier));
    client.connect().await.unwrap();

    client.disconnect().await;
    client.disconnect().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_externally_killed_server_fails_next_call() {
    let (notifier, mut events) = notifier();
    let client = echo_client_with_notifier(&[], Duration::from_secs(10), Some(notifier));
    client.connect().await.unwrap();
    assert!(!client.list_tools().await.unwrap().is_empty());

    let pid = client.process_id().await.expect("running server has a pid");
    let killed = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(killed.success());

    wait_for_status(&client, ConnectionStatus::Disconnected).await;
    let err = client
        .call_tool("echo", json!({ "text": "anyone?" }))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connection { .. }));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.reason.contains("exited"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_utf8_stderr_keeps_pipe_drained() {
    let init_reply = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "sh", "version": "0" },
        },
    });
    // Invalid UTF-8 first, then enough stderr traffic that a closed pipe
    // would kill the shell before it answers.
    let script = format!(
        r#"printf '\377\376 not utf-8\n' >&2
read -r request
sleep 0.2
i=0
while [ $i -lt 50 ]; do printf 'log line %s\n' $i >&2; i=$((i+1)); done
printf '%s\n' '{init_reply}'
cat > /dev/null"#
    );
    let client = StdioClient::new(
        "noisy-stderr",
        "sh",
        vec!["-c".to_string(), script],
        HashMap::new(),
        Duration::from_secs(5),
        ManagerSettings::default(),
        None,
    );

    client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect().await;
}
