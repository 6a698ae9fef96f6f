//! Agent run bookkeeping — one row per agent-loop invocation.

use super::Db;
use crate::db::models::{AgentRunRow, RunStatus};
use crate::error::Result;
use crate::{ConversationId, RunId};
use anyhow::Context as _;
use sqlx::Row as _;

pub struct AgentRunStore<'a> {
    db: &'a Db,
}

impl<'a> AgentRunStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub async fn start(&self, conversation_id: ConversationId, input_message_id: i64) -> Result<AgentRunRow> {
        let id = RunId::new_v4();
        sqlx::query(
            "INSERT INTO agent_runs (id, conversation_id, input_message_id, status) \
             VALUES (?, ?, ?, 'running')",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(input_message_id)
        .execute(&self.db.pool)
        .await
        .context("failed to insert agent run")?;

        self.get(id).await?.context("run vanished after insert").map_err(Into::into)
    }

    pub async fn get(&self, id: RunId) -> Result<Option<AgentRunRow>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, input_message_id, status, input_tokens, output_tokens, \
             error_text, started_at, ended_at FROM agent_runs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch agent run")?;

        row.map(row_to_run).transpose()
    }

    pub async fn set_status(&self, id: RunId, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE agent_runs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await
            .context("failed to update agent run status")?;
        Ok(())
    }

    pub async fn finish(
        &self,
        id: RunId,
        status: RunStatus,
        input_tokens: i64,
        output_tokens: i64,
        error_text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_runs SET status = ?, input_tokens = ?, output_tokens = ?, error_text = ?, \
             ended_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(error_text)
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to finish agent run")?;
        Ok(())
    }
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> Result<AgentRunRow> {
    let status: String = row.try_get("status")?;
    Ok(AgentRunRow {
        id: row.try_get::<String, _>("id")?.parse().context("invalid run id")?,
        conversation_id: row
            .try_get::<String, _>("conversation_id")?
            .parse()
            .context("invalid conversation id")?,
        input_message_id: row.try_get("input_message_id")?,
        status: status.parse()?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        error_text: row.try_get("error_text")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}
