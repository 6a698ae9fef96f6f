//! HITL approval request persistence.

use super::Db;
use crate::db::models::{ApprovalRow, ApprovalStatus, RiskLevel};
use crate::error::Result;
use crate::{ApprovalId, ConversationId, RunId};
use anyhow::Context as _;
use sqlx::Row as _;

pub struct ApprovalStore<'a> {
    db: &'a Db,
}

impl<'a> ApprovalStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        run_id: RunId,
        conversation_id: ConversationId,
        channel_type: crate::ChannelType,
        tool_name: &str,
        tool_input: &serde_json::Value,
        risk_level: RiskLevel,
        timeout_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<ApprovalRow> {
        let id = ApprovalId::new_v4();
        sqlx::query(
            "INSERT INTO approval_requests \
             (id, run_id, conversation_id, channel_type, tool_name, tool_input, risk_level, \
              status, timeout_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(conversation_id.to_string())
        .bind(channel_type.to_string())
        .bind(tool_name)
        .bind(tool_input.to_string())
        .bind(risk_level.as_str())
        .bind(timeout_at.to_rfc3339())
        .bind(timeout_at.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .context("failed to insert approval request")?;

        self.get(id)
            .await?
            .context("approval vanished after insert")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: ApprovalId) -> Result<Option<ApprovalRow>> {
        let row = sqlx::query(
            "SELECT id, run_id, conversation_id, channel_type, tool_name, tool_input, risk_level, \
             status, reason, responder_id, requested_at, responded_at, timeout_at \
             FROM approval_requests WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch approval request")?;

        row.map(row_to_approval).transpose()
    }

    pub async fn respond(
        &self,
        id: ApprovalId,
        status: ApprovalStatus,
        responder_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE approval_requests SET status = ?, responder_id = ?, reason = ?, \
             responded_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(responder_id)
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to respond to approval request")?;
        Ok(())
    }

    /// Every still-`pending` row whose timeout has passed — used by the
    /// periodic sweep that resolves stale approvals without a human reply.
    pub async fn list_timed_out(&self) -> Result<Vec<ApprovalRow>> {
        let rows = sqlx::query(
            "SELECT id, run_id, conversation_id, channel_type, tool_name, tool_input, risk_level, \
             status, reason, responder_id, requested_at, responded_at, timeout_at \
             FROM approval_requests WHERE status = 'pending' \
             AND timeout_at <= strftime('%Y-%m-%dT%H:%M:%fZ','now')",
        )
        .fetch_all(&self.db.pool)
        .await
        .context("failed to list timed out approvals")?;

        rows.into_iter().map(row_to_approval).collect()
    }
}

fn row_to_approval(row: sqlx::sqlite::SqliteRow) -> Result<ApprovalRow> {
    let channel_type: String = row.try_get("channel_type")?;
    let risk_level: String = row.try_get("risk_level")?;
    let status: String = row.try_get("status")?;
    let tool_input: String = row.try_get("tool_input")?;
    Ok(ApprovalRow {
        id: row
            .try_get::<String, _>("id")?
            .parse()
            .context("invalid approval id")?,
        run_id: row.try_get::<String, _>("run_id")?.parse().context("invalid run id")?,
        conversation_id: row
            .try_get::<String, _>("conversation_id")?
            .parse()
            .context("invalid conversation id")?,
        channel_type: parse_channel_type(&channel_type)?,
        tool_name: row.try_get("tool_name")?,
        tool_input: serde_json::from_str(&tool_input).unwrap_or(serde_json::Value::Null),
        risk_level: risk_level.parse()?,
        status: status.parse()?,
        reason: row.try_get("reason")?,
        responder_id: row.try_get("responder_id")?,
        requested_at: row.try_get("requested_at")?,
        responded_at: row.try_get("responded_at")?,
        timeout_at: row.try_get("timeout_at")?,
    })
}

fn parse_channel_type(s: &str) -> Result<crate::ChannelType> {
    Ok(match s {
        "telegram" => crate::ChannelType::Telegram,
        "whatsapp" => crate::ChannelType::Whatsapp,
        "email" => crate::ChannelType::Email,
        "slack" => crate::ChannelType::Slack,
        "discord" => crate::ChannelType::Discord,
        "mattermost" => crate::ChannelType::Mattermost,
        "webhook" => crate::ChannelType::Webhook,
        "web_widget" => crate::ChannelType::WebWidget,
        other => {
            return Err(crate::error::DbError::Invariant(format!("unknown channel type '{other}'")).into())
        }
    })
}
