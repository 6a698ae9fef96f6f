//! MCP server registration and container/connection state.

use super::Db;
use crate::db::models::{McpServerRow, McpTransport};
use crate::error::Result;
use anyhow::Context as _;
use sqlx::Row as _;

pub struct McpServerStore<'a> {
    db: &'a Db,
}

impl<'a> McpServerStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        name: &str,
        image: &str,
        transport: McpTransport,
        command: Option<&str>,
        args: &[String],
        env_encrypted: &str,
        volumes: &[String],
    ) -> Result<McpServerRow> {
        let id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO mcp_servers (id, name, image, transport, command, args, env_encrypted, volumes) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(image)
        .bind(transport.as_str())
        .bind(command)
        .bind(serde_json::to_string(args).unwrap_or_else(|_| "[]".into()))
        .bind(env_encrypted)
        .bind(serde_json::to_string(volumes).unwrap_or_else(|_| "[]".into()))
        .execute(&self.db.pool)
        .await
        .context("failed to register MCP server")?;

        self.get(id)
            .await?
            .context("MCP server vanished after insert")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: uuid::Uuid) -> Result<Option<McpServerRow>> {
        let row = sqlx::query(
            "SELECT id, name, image, transport, port, command, args, env_encrypted, volumes, \
             status, container_id, host_port, cached_tools, last_error FROM mcp_servers WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch MCP server")?;

        row.map(row_to_server).transpose()
    }

    pub async fn list(&self) -> Result<Vec<McpServerRow>> {
        let rows = sqlx::query(
            "SELECT id, name, image, transport, port, command, args, env_encrypted, volumes, \
             status, container_id, host_port, cached_tools, last_error FROM mcp_servers",
        )
        .fetch_all(&self.db.pool)
        .await
        .context("failed to list MCP servers")?;

        rows.into_iter().map(row_to_server).collect()
    }

    pub async fn set_running(
        &self,
        id: uuid::Uuid,
        container_id: &str,
        host_port: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE mcp_servers SET status = 'running', container_id = ?, host_port = ?, \
             last_error = NULL, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(container_id)
        .bind(host_port)
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to mark MCP server running")?;
        Ok(())
    }

    pub async fn set_errored(&self, id: uuid::Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE mcp_servers SET status = 'error', last_error = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(error)
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to mark MCP server errored")?;
        Ok(())
    }

    pub async fn cache_tools(&self, id: uuid::Uuid, tool_names: &[String]) -> Result<()> {
        sqlx::query("UPDATE mcp_servers SET cached_tools = ? WHERE id = ?")
            .bind(serde_json::to_string(tool_names).unwrap_or_else(|_| "[]".into()))
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await
            .context("failed to cache MCP tool list")?;
        Ok(())
    }
}

fn row_to_server(row: sqlx::sqlite::SqliteRow) -> Result<McpServerRow> {
    let transport: String = row.try_get("transport")?;
    let args: String = row.try_get("args")?;
    let volumes: String = row.try_get("volumes")?;
    let cached_tools: String = row.try_get("cached_tools")?;
    Ok(McpServerRow {
        id: row.try_get::<String, _>("id")?.parse().context("invalid mcp server id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        transport: transport.parse()?,
        port: row.try_get("port")?,
        command: row.try_get("command")?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        env_encrypted: row.try_get("env_encrypted")?,
        volumes: serde_json::from_str(&volumes).unwrap_or_default(),
        status: row.try_get("status")?,
        container_id: row.try_get("container_id")?,
        host_port: row.try_get("host_port")?,
        cached_tools: serde_json::from_str(&cached_tools).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
    })
}
