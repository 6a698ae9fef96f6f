//! Channel registration and connection-status bookkeeping.

use super::Db;
use crate::db::models::ChannelRow;
use crate::error::Result;
use crate::{ChannelId, ChannelType, ConnectionStatus};
use anyhow::Context as _;
use sqlx::Row as _;

pub struct ChannelStore<'a> {
    db: &'a Db,
}

impl<'a> ChannelStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        channel_type: ChannelType,
        display_name: &str,
        config: &serde_json::Value,
    ) -> Result<ChannelRow> {
        let id = ChannelId::new_v4();
        sqlx::query(
            "INSERT INTO channels (id, channel_type, display_name, config) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(channel_type.to_string())
        .bind(display_name)
        .bind(config.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to insert channel")?;

        self.get(id).await?.context("channel vanished after insert").map_err(Into::into)
    }

    pub async fn get(&self, id: ChannelId) -> Result<Option<ChannelRow>> {
        let row = sqlx::query(
            "SELECT id, channel_type, display_name, config, enabled, connection_status, \
             last_error, created_at, updated_at FROM channels WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch channel")?;

        row.map(row_to_channel).transpose()
    }

    /// Find the single channel row for `channel_type`, creating it with
    /// an empty config if this is the first message an adapter of this
    /// type has ever produced. Webhook-style adapters (generic webhook,
    /// Mattermost) have exactly one row per type rather than one per
    /// external chat, unlike conversations which are per-chat.
    pub async fn get_or_create_by_type(&self, channel_type: ChannelType) -> Result<ChannelRow> {
        let row = sqlx::query(
            "SELECT id, channel_type, display_name, config, enabled, connection_status, \
             last_error, created_at, updated_at FROM channels WHERE channel_type = ? LIMIT 1",
        )
        .bind(channel_type.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to look up channel by type")?;

        if let Some(row) = row {
            return row_to_channel(row);
        }

        self.create(channel_type, &channel_type.to_string(), &serde_json::json!({}))
            .await
    }

    pub async fn list_enabled(&self) -> Result<Vec<ChannelRow>> {
        let rows = sqlx::query(
            "SELECT id, channel_type, display_name, config, enabled, connection_status, \
             last_error, created_at, updated_at FROM channels WHERE enabled = 1",
        )
        .fetch_all(&self.db.pool)
        .await
        .context("failed to list channels")?;

        rows.into_iter().map(row_to_channel).collect()
    }

    pub async fn update_config(&self, id: ChannelId, config: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE channels SET config = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?")
            .bind(config.to_string())
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await
            .context("failed to update channel config")?;
        Ok(())
    }

    pub async fn set_connection_status(
        &self,
        id: ChannelId,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE channels SET connection_status = ?, last_error = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(serde_json::to_value(status)?.as_str().unwrap_or_default())
        .bind(last_error)
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to update channel connection status")?;
        Ok(())
    }
}

fn row_to_channel(row: sqlx::sqlite::SqliteRow) -> Result<ChannelRow> {
    let channel_type: String = row.try_get("channel_type")?;
    let connection_status: String = row.try_get("connection_status")?;
    let config_text: String = row.try_get("config")?;
    Ok(ChannelRow {
        id: row
            .try_get::<String, _>("id")?
            .parse()
            .context("invalid channel id")?,
        channel_type: parse_channel_type(&channel_type)?,
        display_name: row.try_get("display_name")?,
        config: serde_json::from_str(&config_text).unwrap_or(serde_json::Value::Null),
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        connection_status: parse_connection_status(&connection_status)?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_channel_type(s: &str) -> Result<ChannelType> {
    Ok(match s {
        "telegram" => ChannelType::Telegram,
        "whatsapp" => ChannelType::Whatsapp,
        "email" => ChannelType::Email,
        "slack" => ChannelType::Slack,
        "discord" => ChannelType::Discord,
        "mattermost" => ChannelType::Mattermost,
        "webhook" => ChannelType::Webhook,
        "web_widget" => ChannelType::WebWidget,
        other => {
            return Err(crate::error::DbError::Invariant(format!("unknown channel type '{other}'")).into())
        }
    })
}

fn parse_connection_status(s: &str) -> Result<ConnectionStatus> {
    Ok(match s {
        "disconnected" => ConnectionStatus::Disconnected,
        "connecting" => ConnectionStatus::Connecting,
        "connected" => ConnectionStatus::Connected,
        "error" => ConnectionStatus::Error,
        other => {
            return Err(
                crate::error::DbError::Invariant(format!("unknown connection status '{other}'")).into(),
            )
        }
    })
}
