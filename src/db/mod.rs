//! Embedded SQL persistence.
//!
//! A single `sqlx::SqlitePool` backs every table named in the data model.
//! Schema evolution is additive: on boot we inspect `PRAGMA table_info`
//! for each table and issue `ALTER TABLE ... ADD COLUMN` for anything
//! missing, rather than a version-numbered migration runner — the
//! simplest mechanism that satisfies "detect missing columns/tables and
//! apply" without a full migration DSL.

pub mod models;
pub mod approvals;
pub mod channels;
pub mod conversations;
pub mod runs;
pub mod skills;
pub mod mcp_servers;
pub mod api_calls;

use crate::error::{DbError, Result};
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Handle to the embedded database. Cheap to clone (wraps a connection pool).
#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// additive migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("invalid database path: {}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqliteConnect)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {statement}")))?;
        }
        self.apply_additive_columns().await?;
        Ok(())
    }

    /// Detect columns referenced by the current schema but missing from an
    /// older on-disk table, and add them. New installs already have every
    /// column from `SCHEMA_STATEMENTS`, so this is a no-op for them.
    async fn apply_additive_columns(&self) -> Result<()> {
        const ADDITIVE: &[(&str, &str, &str)] = &[
            // (table, column, "ADD COLUMN" fragment)
            ("approval_requests", "expires_at", "expires_at TEXT"),
        ];

        for (table, column, add_fragment) in ADDITIVE {
            let has_column: bool = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?"
            ))
            .bind(column)
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0i64)
                > 0;
            if !has_column {
                let stmt = format!("ALTER TABLE {table} ADD COLUMN {add_fragment}");
                sqlx::query(&stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| DbError::Migration(format!("{e}: {stmt}")))?;
            }
        }
        Ok(())
    }

    pub fn channels(&self) -> channels::ChannelStore<'_> {
        channels::ChannelStore::new(self)
    }

    pub fn conversations(&self) -> conversations::ConversationStore<'_> {
        conversations::ConversationStore::new(self)
    }

    pub fn runs(&self) -> runs::AgentRunStore<'_> {
        runs::AgentRunStore::new(self)
    }

    pub fn approvals(&self) -> approvals::ApprovalStore<'_> {
        approvals::ApprovalStore::new(self)
    }

    pub fn skills(&self) -> skills::SkillRegistryStore<'_> {
        skills::SkillRegistryStore::new(self)
    }

    pub fn mcp_servers(&self) -> mcp_servers::McpServerStore<'_> {
        mcp_servers::McpServerStore::new(self)
    }

    pub fn api_calls(&self) -> api_calls::ApiCallLogStore<'_> {
        api_calls::ApiCallLogStore::new(self)
    }
}

/// Every `CREATE TABLE IF NOT EXISTS` plus index, applied in order on boot.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        channel_type TEXT NOT NULL,
        display_name TEXT NOT NULL,
        config TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        connection_status TEXT NOT NULL DEFAULT 'disconnected',
        last_error TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
        external_chat_id TEXT NOT NULL,
        title TEXT,
        active_branch_id TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        UNIQUE(channel_id, external_chat_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS branches (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        parent_branch_id TEXT REFERENCES branches(id) ON DELETE CASCADE,
        branch_point_message_id INTEGER,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        branch_id TEXT NOT NULL REFERENCES branches(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        inbound_channel_type TEXT,
        external_sender TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_branch ON messages(branch_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_runs (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        input_message_id INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        error_text TEXT,
        started_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        ended_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_conversation ON agent_runs(conversation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS approval_rules (
        tool_name TEXT PRIMARY KEY,
        risk_level TEXT NOT NULL,
        auto_approve INTEGER NOT NULL DEFAULT 0,
        require_approval INTEGER NOT NULL DEFAULT 0,
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        timeout_action TEXT NOT NULL DEFAULT 'reject'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS approval_requests (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        channel_type TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        tool_input TEXT NOT NULL,
        risk_level TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        reason TEXT,
        responder_id TEXT,
        requested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        responded_at TEXT,
        timeout_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_approvals_status ON approval_requests(status)",
    r#"
    CREATE TABLE IF NOT EXISTS skills_registry (
        name TEXT PRIMARY KEY,
        enabled INTEGER NOT NULL DEFAULT 1,
        origin TEXT NOT NULL DEFAULT 'user',
        directory TEXT,
        manifest_version TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mcp_servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        image TEXT NOT NULL,
        transport TEXT NOT NULL,
        port INTEGER,
        command TEXT,
        args TEXT NOT NULL DEFAULT '[]',
        env_encrypted TEXT NOT NULL DEFAULT '',
        volumes TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'stopped',
        container_id TEXT,
        host_port INTEGER,
        cached_tools TEXT NOT NULL DEFAULT '[]',
        last_error TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        isolated INTEGER NOT NULL DEFAULT 0,
        group_id TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_api_calls_created_at ON api_calls(created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        key TEXT PRIMARY KEY,
        window_start TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Db::connect_in_memory().await.unwrap();
        // Running again must not fail (CREATE TABLE IF NOT EXISTS, etc).
        db.migrate().await.unwrap();
    }
}
