use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mcp_bridge::config::{self, BridgeConfig};
use mcp_bridge::logging;
use mcp_bridge::mcp_client::{ConnectionStatus, McpRegistry};
use mcp_bridge::store::{ServerStore, SqliteServerStore};

#[derive(Parser, Debug)]
#[command(name = "mcp-bridge")]
#[command(version)]
#[command(about = "Keep MCP tool servers connected behind one registry")]
struct Args {
    /// Configuration file (YAML or JSON). Defaults to `<data dir>/mcp-bridge.yaml`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the server store and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every configured server and stay up until Ctrl-C (default)
    Run,

    /// List the tools of one server
    Tools {
        /// Server id
        server: String,
    },

    /// Invoke one tool and print its text output
    Call {
        /// Server id
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },

    /// Show the persisted status of every configured server
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = args.data_dir.clone().unwrap_or_else(config::data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let log_path = logging::init_tracing(&data_dir.join("logs"), args.json_logs)
        .context("failed to initialize logging")?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("mcp-bridge.yaml"));
    let bridge = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        tracing::warn!(path = %config_path.display(), "config file not found, using stored servers only");
        BridgeConfig::default()
    };

    let store = Arc::new(
        SqliteServerStore::open(data_dir.join("mcp-bridge.db")).context("failed to open store")?,
    );
    for server in &bridge.servers {
        store.upsert_config(server)?;
    }
    tracing::info!(
        config = %config_path.display(),
        servers = bridge.servers.len(),
        "configuration loaded"
    );

    let registry = McpRegistry::new(store.clone(), bridge.settings.clone());

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&registry, &store, &log_path).await,
        Command::Tools { server } => {
            let tools = registry.list_tools(&server).await;
            // One-shot use must not mark the server for restore on the next run.
            registry.disconnect(&server).await;
            let tools = tools?;
            for tool in &tools {
                println!("{:<24} {}", tool.name, tool.description);
            }
            Ok(())
        }
        Command::Call {
            server,
            tool,
            arguments,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&arguments).context("arguments must be a JSON object")?;
            if !arguments.is_object() {
                bail!("arguments must be a JSON object");
            }
            let result = registry.call_tool(&server, &tool, arguments).await;
            registry.disconnect(&server).await;

            let result = result?;
            println!("{}", result.text());
            if result.is_error {
                bail!("tool '{tool}' reported an error");
            }
            Ok(())
        }
        Command::Status => {
            for server in store.list_configs()? {
                let status = store
                    .get_status(&server.id)?
                    .unwrap_or(ConnectionStatus::Disconnected);
                println!(
                    "{:<20} {:<16} {}",
                    server.id,
                    server.transport.kind(),
                    status
                );
            }
            Ok(())
        }
    }
}

/// Restore, connect the rest, then idle until Ctrl-C.
async fn run(
    registry: &Arc<McpRegistry>,
    store: &SqliteServerStore,
    log_path: &std::path::Path,
) -> anyhow::Result<()> {
    for (id, outcome) in registry.restore_connections().await {
        if outcome.is_ok() {
            tracing::info!(server = %id, "restored");
        }
    }

    let configured = store.list_configs()?;
    let pending: Vec<_> = {
        let connected = registry.get_connected_ids().await;
        configured
            .iter()
            .filter(|c| !connected.contains(&c.id))
            .map(|c| c.id.clone())
            .collect()
    };
    let outcomes = futures::future::join_all(pending.iter().map(|id| registry.connect(id))).await;
    for (id, outcome) in pending.iter().zip(outcomes) {
        if let Err(e) = outcome {
            eprintln!("{id}: {e}");
        }
    }

    for id in registry.get_connected_ids().await {
        match registry.list_tools(&id).await {
            Ok(tools) => {
                let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                tracing::info!(server = %id, tools = ?names, "tools available");
                println!("{id}: {} tool(s)", tools.len());
            }
            Err(e) => tracing::warn!(server = %id, error = %e, "failed to list tools"),
        }
    }

    println!(
        "{} of {} server(s) connected; logging to {}. Press Ctrl-C to stop.",
        registry.get_connected_ids().await.len(),
        configured.len(),
        log_path.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    registry.disconnect_all().await;
    Ok(())
}
