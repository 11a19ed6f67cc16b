//! SQLite-backed [`ServerStore`].
//!
//! WAL mode is enabled so a CLI can inspect the file while the bridge runs.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::ServerStore;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{ConnectionStatus, ServerConfig, TransportConfig};

// ─── SqliteServerStore ───────────────────────────────────────────────────────

pub struct SqliteServerStore {
    conn: Mutex<Connection>,
}

impl SqliteServerStore {
    /// Open (or create) the store at `path`.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), McpError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS mcp_servers (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL DEFAULT '',
                    transport TEXT NOT NULL,
                    timeout_secs INTEGER NOT NULL DEFAULT 30,
                    status TEXT NOT NULL DEFAULT 'disconnected',
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_mcp_servers_status
                    ON mcp_servers(status);
                ",
            )?;
            Ok(())
        })
    }

    /// Persisted status of `id`, if the server is known.
    pub fn get_status(&self, id: &str) -> Result<Option<ConnectionStatus>, McpError> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM mcp_servers WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|s| s.parse::<ConnectionStatus>()).transpose()
    }

    /// Every stored configuration, ordered by id.
    pub fn list_configs(&self) -> Result<Vec<ServerConfig>, McpError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, transport, timeout_secs FROM mcp_servers ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut configs = Vec::new();
            for row in rows {
                let (id, name, transport, timeout_secs) = row?;
                configs.push(row_to_config(id, name, &transport, timeout_secs)?);
            }
            Ok(configs)
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, McpError>,
    ) -> Result<T, McpError> {
        let conn = self.conn.lock().map_err(|_| McpError::Store {
            reason: "store connection lock poisoned".to_string(),
        })?;
        f(&conn)
    }
}

impl ServerStore for SqliteServerStore {
    fn find_config(&self, id: &str) -> Result<Option<ServerConfig>, McpError> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, transport, timeout_secs FROM mcp_servers WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        row.map(|(id, name, transport, timeout_secs)| {
            row_to_config(id, name, &transport, timeout_secs)
        })
        .transpose()
    }

    fn set_status(&self, id: &str, status: ConnectionStatus) -> Result<(), McpError> {
        let updated = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE mcp_servers SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )?)
        })?;
        if updated == 0 {
            return Err(McpError::Store {
                reason: format!("unknown server '{id}'"),
            });
        }
        Ok(())
    }

    fn find_ids_by_status(&self, status: ConnectionStatus) -> Result<Vec<String>, McpError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM mcp_servers WHERE status = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn upsert_config(&self, config: &ServerConfig) -> Result<(), McpError> {
        let transport = serde_json::to_string(&config.transport).map_err(|e| McpError::Store {
            reason: format!("failed to encode transport for '{}': {e}", config.id),
        })?;
        let timeout_secs = i64::try_from(config.timeout_secs).unwrap_or(i64::MAX);

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mcp_servers (id, name, transport, timeout_secs)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    transport = excluded.transport,
                    timeout_secs = excluded.timeout_secs,
                    updated_at = datetime('now')",
                params![config.id, config.name, transport, timeout_secs],
            )?;
            Ok(())
        })
    }
}

fn row_to_config(
    id: String,
    name: String,
    transport: &str,
    timeout_secs: i64,
) -> Result<ServerConfig, McpError> {
    let transport: TransportConfig = serde_json::from_str(transport).map_err(|e| McpError::Store {
        reason: format!("corrupt transport for '{id}': {e}"),
    })?;
    Ok(ServerConfig {
        id,
        name,
        transport,
        timeout_secs: u64::try_from(timeout_secs).unwrap_or(0),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
