use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use mcp_bridge::config::ManagerSettings;
use mcp_bridge::mcp_client::{
    ConnectionStatus, McpConnection, McpError, McpRegistry, ServerConfig, TransportConfig,
};
use mcp_bridge::store::{ServerStore, SqliteServerStore};

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_echo-mcp-server");

fn echo_config(id: &str) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        name: "Echo".to_string(),
        transport: TransportConfig::Stdio {
            command: ECHO_SERVER.to_string(),
            args: vec![],
            env: HashMap::new(),
        },
        timeout_secs: 10,
    }
}

fn setup(ids: &[&str]) -> (Arc<McpRegistry>, Arc<SqliteServerStore>) {
    let store = Arc::new(SqliteServerStore::open(":memory:").unwrap());
    for id in ids {
        store.upsert_config(&echo_config(id)).unwrap();
    }
    let registry = McpRegistry::new(store.clone(), ManagerSettings::default());
    (registry, store)
}

async fn pid_of(registry: &McpRegistry, id: &str) -> Option<u32> {
    match registry.client(id).await.as_deref() {
        Some(McpConnection::Stdio(client)) => client.process_id().await,
        _ => None,
    }
}

/// Poll until `check` holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_list_tools_connects_lazily() {
    let (registry, store) = setup(&["echo"]);
    assert_eq!(registry.get_status("echo").await, ConnectionStatus::Disconnected);

    let tools = registry.list_tools("echo").await.unwrap();
    assert!(!tools.is_empty());
    assert_eq!(registry.get_status("echo").await, ConnectionStatus::Connected);
    assert_eq!(registry.get_connected_ids().await, vec!["echo".to_string()]);
    assert_eq!(
        store.get_status("echo").unwrap(),
        Some(ConnectionStatus::Connected)
    );

    let result = registry
        .call_tool("echo", "echo", json!({ "text": "via registry" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "via registry");

    registry.disconnect_all().await;
}

#[tokio::test]
async fn test_concurrent_connects_share_one_client() {
    let (registry, _) = setup(&["echo"]);

    let outcomes = join_all((0..8).map(|_| registry.connect("echo"))).await;
    assert!(outcomes.iter().all(Result::is_ok));

    let client = registry.client("echo").await.unwrap();
    let pid = pid_of(&registry, "echo").await;
    assert!(pid.is_some());

    let outcomes = join_all((0..8).map(|_| registry.list_tools("echo"))).await;
    assert!(outcomes.iter().all(Result::is_ok));

    let after = registry.client("echo").await.unwrap();
    assert!(Arc::ptr_eq(&client, &after));
    assert_eq!(pid_of(&registry, "echo").await, pid);

    registry.disconnect_all().await;
}

#[tokio::test]
async fn test_crash_removes_entry_and_marks_store() {
    let (registry, store) = setup(&["echo"]);
    registry.connect("echo").await.unwrap();

    let err = registry
        .call_tool("echo", "crash", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connection { .. }));

    eventually(|| {
        let registry = Arc::clone(&registry);
        async move { registry.client("echo").await.is_none() }
    })
    .await;
    assert_eq!(registry.get_status("echo").await, ConnectionStatus::Disconnected);
    assert!(registry.get_connected_ids().await.is_empty());

    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.get_status("echo").unwrap() == Some(ConnectionStatus::Disconnected) }
    })
    .await;
}

#[tokio::test]
async fn test_next_call_after_crash_reconnects() {
    let (registry, _) = setup(&["echo"]);
    registry.connect("echo").await.unwrap();
    let first_pid = pid_of(&registry, "echo").await;

    let _ = registry.call_tool("echo", "crash", json!({})).await;

    let result = registry
        .call_tool("echo", "echo", json!({ "text": "back" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "back");
    let second_pid = pid_of(&registry, "echo").await;
    assert!(second_pid.is_some());
    assert_ne!(first_pid, second_pid);

    registry.disconnect_all().await;
}

#[tokio::test]
async fn test_disconnect_records_status() {
    let (registry, store) = setup(&["echo"]);
    registry.connect("echo").await.unwrap();

    registry.disconnect("echo").await;
    assert!(registry.client("echo").await.is_none());
    assert_eq!(
        store.get_status("echo").unwrap(),
        Some(ConnectionStatus::Disconnected)
    );

    // Absent: no-op.
    registry.disconnect("echo").await;
}

#[tokio::test]
async fn test_disconnect_all_keeps_persisted_status() {
    let (registry, store) = setup(&["one", "two"]);
    registry.connect("one").await.unwrap();
    registry.connect("two").await.unwrap();
    assert_eq!(
        registry.get_connected_ids().await,
        vec!["one".to_string(), "two".to_string()]
    );

    registry.disconnect_all().await;
    assert!(registry.get_connected_ids().await.is_empty());
    assert_eq!(
        store.find_ids_by_status(ConnectionStatus::Connected).unwrap(),
        vec!["one".to_string(), "two".to_string()]
    );
}

#[tokio::test]
async fn test_one_shot_use_is_not_restored() {
    let (registry, store) = setup(&["echo"]);
    let result = registry
        .call_tool("echo", "echo", json!({ "text": "once" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "once");
    registry.disconnect("echo").await;
    drop(registry);

    let next_run = McpRegistry::new(store.clone(), ManagerSettings::default());
    assert!(next_run.restore_connections().await.is_empty());
    assert!(next_run.get_connected_ids().await.is_empty());
}

#[tokio::test]
async fn test_restore_reconnects_previous_servers() {
    let store = Arc::new(SqliteServerStore::open(":memory:").unwrap());
    for id in ["one", "two", "idle"] {
        store.upsert_config(&echo_config(id)).unwrap();
    }
    store.set_status("one", ConnectionStatus::Connected).unwrap();
    store.set_status("two", ConnectionStatus::Connected).unwrap();

    let registry = McpRegistry::new(store.clone(), ManagerSettings::default());
    let outcomes = registry.restore_connections().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(
        registry.get_connected_ids().await,
        vec!["one".to_string(), "two".to_string()]
    );

    registry.disconnect_all().await;
}

#[tokio::test]
async fn test_unknown_server_is_connection_error() {
    let (registry, _) = setup(&[]);
    let err = registry
        .call_tool("nowhere", "echo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connection { ref server_id, .. } if server_id == "nowhere"));
    assert_eq!(registry.get_status("nowhere").await, ConnectionStatus::Disconnected);
}
