//! LLM call accounting, used for usage logging and rate-limit windows.

use super::Db;
use crate::db::models::ApiCallRow;
use crate::error::Result;
use crate::ConversationId;
use anyhow::Context as _;
use sqlx::Row as _;

pub struct ApiCallLogStore<'a> {
    db: &'a Db,
}

impl<'a> ApiCallLogStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        conversation_id: ConversationId,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        duration_ms: i64,
        isolated: bool,
        group_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_calls (conversation_id, model, input_tokens, output_tokens, \
             duration_ms, isolated, group_id) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(model)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(duration_ms)
        .bind(isolated)
        .bind(group_id)
        .execute(&self.db.pool)
        .await
        .context("failed to record api call")?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<ApiCallRow>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, model, input_tokens, output_tokens, duration_ms, \
             isolated, group_id, created_at FROM api_calls ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await
        .context("failed to list recent api calls")?;

        rows.into_iter()
            .map(|row| {
                Ok(ApiCallRow {
                    id: row.try_get("id")?,
                    conversation_id: row
                        .try_get::<String, _>("conversation_id")?
                        .parse()
                        .context("invalid conversation id")?,
                    model: row.try_get("model")?,
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                    duration_ms: row.try_get("duration_ms")?,
                    isolated: row.try_get::<i64, _>("isolated")? != 0,
                    group_id: row.try_get("group_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Count of calls for `conversation_id` in the trailing window, used by
    /// the Conversation Router's per-conversation rate gate.
    pub async fn count_since(
        &self,
        conversation_id: ConversationId,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_calls WHERE conversation_id = ? AND created_at >= ?",
        )
        .bind(conversation_id.to_string())
        .bind(since.to_rfc3339())
        .fetch_one(&self.db.pool)
        .await
        .context("failed to count recent api calls")?;
        Ok(count)
    }
}
