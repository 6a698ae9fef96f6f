//! Conversation, branch, and message persistence.
//!
//! Branches form a tree per conversation; message history for a branch is
//! assembled by walking from its branch-point message back through its
//! parent chain, generalizing a flat per-channel log to a branch graph.

use super::Db;
use crate::db::models::{BranchRow, ConversationRow, MessageRole, MessageRow};
use crate::error::Result;
use crate::{BranchId, ChannelId, ConversationId};
use anyhow::Context as _;
use sqlx::Row as _;

pub struct ConversationStore<'a> {
    db: &'a Db,
}

impl<'a> ConversationStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Find the conversation for a channel + external chat id, creating it
    /// (with a root branch named "main") if this is the first message seen.
    pub async fn get_or_create(
        &self,
        channel_id: ChannelId,
        external_chat_id: &str,
    ) -> Result<ConversationRow> {
        if let Some(existing) = self.find(channel_id, external_chat_id).await? {
            return Ok(existing);
        }

        let conversation_id = ConversationId::new_v4();
        let branch_id = BranchId::new_v4();

        let mut tx = self.db.pool.begin().await.context("failed to begin tx")?;

        sqlx::query(
            "INSERT INTO conversations (id, channel_id, external_chat_id, active_branch_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(channel_id.to_string())
        .bind(external_chat_id)
        .bind(branch_id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to insert conversation")?;

        sqlx::query(
            "INSERT INTO branches (id, conversation_id, parent_branch_id, branch_point_message_id, name) \
             VALUES (?, ?, NULL, NULL, 'main')",
        )
        .bind(branch_id.to_string())
        .bind(conversation_id.to_string())
        .execute(&mut *tx)
        .await
        .context("failed to insert root branch")?;

        tx.commit().await.context("failed to commit new conversation")?;

        self.find(channel_id, external_chat_id)
            .await?
            .context("conversation vanished after insert")
            .map_err(Into::into)
    }

    pub async fn find(
        &self,
        channel_id: ChannelId,
        external_chat_id: &str,
    ) -> Result<Option<ConversationRow>> {
        let row = sqlx::query(
            "SELECT id, channel_id, external_chat_id, title, active_branch_id, created_at, updated_at \
             FROM conversations WHERE channel_id = ? AND external_chat_id = ?",
        )
        .bind(channel_id.to_string())
        .bind(external_chat_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to look up conversation")?;

        row.map(row_to_conversation).transpose()
    }

    pub async fn get(&self, id: ConversationId) -> Result<Option<ConversationRow>> {
        let row = sqlx::query(
            "SELECT id, channel_id, external_chat_id, title, active_branch_id, created_at, updated_at \
             FROM conversations WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch conversation")?;

        row.map(row_to_conversation).transpose()
    }

    pub async fn set_active_branch(&self, id: ConversationId, branch_id: BranchId) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET active_branch_id = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
        )
        .bind(branch_id.to_string())
        .bind(id.to_string())
        .execute(&self.db.pool)
        .await
        .context("failed to set active branch")?;
        Ok(())
    }

    /// Create a branch rooted at `branch_point_message_id` within `parent_branch_id`.
    pub async fn create_branch(
        &self,
        conversation_id: ConversationId,
        parent_branch_id: BranchId,
        branch_point_message_id: i64,
        name: &str,
    ) -> Result<BranchRow> {
        let id = BranchId::new_v4();
        sqlx::query(
            "INSERT INTO branches (id, conversation_id, parent_branch_id, branch_point_message_id, name) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(parent_branch_id.to_string())
        .bind(branch_point_message_id)
        .bind(name)
        .execute(&self.db.pool)
        .await
        .context("failed to insert branch")?;

        self.get_branch(id)
            .await?
            .context("branch vanished after insert")
            .map_err(Into::into)
    }

    pub async fn get_branch(&self, id: BranchId) -> Result<Option<BranchRow>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, parent_branch_id, branch_point_message_id, name, created_at \
             FROM branches WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch branch")?;

        row.map(row_to_branch).transpose()
    }

    pub async fn list_branches(&self, conversation_id: ConversationId) -> Result<Vec<BranchRow>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, parent_branch_id, branch_point_message_id, name, created_at \
             FROM branches WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.db.pool)
        .await
        .context("failed to list branches")?;

        rows.into_iter().map(row_to_branch).collect()
    }

    /// A branch may be deleted as long as it isn't the conversation's root
    /// (the one with no parent).
    pub async fn delete_branch(&self, id: BranchId) -> Result<()> {
        let branch = self
            .get_branch(id)
            .await?
            .ok_or_else(|| crate::error::AgentError::BranchNotFound { id: id.to_string() })?;
        if branch.parent_branch_id.is_none() {
            return Err(crate::error::AgentError::CannotDeleteRootBranch.into());
        }
        sqlx::query("DELETE FROM branches WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.db.pool)
            .await
            .context("failed to delete branch")?;
        Ok(())
    }

    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
        role: MessageRole,
        content: &str,
        inbound_channel_type: Option<crate::ChannelType>,
        external_sender: Option<&str>,
    ) -> Result<MessageRow> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (conversation_id, branch_id, role, content, inbound_channel_type, external_sender) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.to_string())
        .bind(branch_id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(inbound_channel_type.map(|t| t.to_string()))
        .bind(external_sender)
        .fetch_one(&self.db.pool)
        .await
        .context("failed to append message")?;

        self.get_message(id)
            .await?
            .context("message vanished after insert")
            .map_err(Into::into)
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, branch_id, role, content, inbound_channel_type, \
             external_sender, created_at FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await
        .context("failed to fetch message")?;

        row.map(row_to_message).transpose()
    }

    /// Delete every message on `branch_id` (used by `/reset`), returning how
    /// many rows were removed.
    pub async fn clear_branch_messages(&self, branch_id: BranchId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE branch_id = ?")
            .bind(branch_id.to_string())
            .execute(&self.db.pool)
            .await
            .context("failed to clear branch messages")?;
        Ok(result.rows_affected())
    }

    /// Count messages on `branch_id` (used by `/status`).
    pub async fn count_messages(&self, branch_id: BranchId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE branch_id = ?")
            .bind(branch_id.to_string())
            .fetch_one(&self.db.pool)
            .await
            .context("failed to count branch messages")?;
        Ok(count)
    }

    /// Assemble the ordered message history visible to `branch_id`: walk up
    /// the parent chain collecting each ancestor's messages up to its own
    /// branch point, then this branch's own messages, oldest first.
    pub async fn assemble_branch_history(&self, branch_id: BranchId) -> Result<Vec<MessageRow>> {
        let mut chain = Vec::new();
        let mut current = self
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| crate::error::AgentError::BranchNotFound {
                id: branch_id.to_string(),
            })?;
        chain.push(current.clone());
        while let Some(parent_id) = current.parent_branch_id {
            current = self
                .get_branch(parent_id)
                .await?
                .ok_or_else(|| crate::error::AgentError::BranchNotFound {
                    id: parent_id.to_string(),
                })?;
            chain.push(current.clone());
        }
        chain.reverse(); // root first

        let mut history = Vec::new();
        for (i, branch) in chain.iter().enumerate() {
            let is_leaf = i + 1 == chain.len();
            let upper_bound = if is_leaf {
                None
            } else {
                chain[i + 1].branch_point_message_id
            };
            let rows = match upper_bound {
                Some(max_id) => {
                    sqlx::query(
                        "SELECT id, conversation_id, branch_id, role, content, inbound_channel_type, \
                         external_sender, created_at FROM messages WHERE branch_id = ? AND id <= ? \
                         ORDER BY id ASC",
                    )
                    .bind(branch.id.to_string())
                    .bind(max_id)
                    .fetch_all(&self.db.pool)
                    .await
                }
                None => {
                    sqlx::query(
                        "SELECT id, conversation_id, branch_id, role, content, inbound_channel_type, \
                         external_sender, created_at FROM messages WHERE branch_id = ? ORDER BY id ASC",
                    )
                    .bind(branch.id.to_string())
                    .fetch_all(&self.db.pool)
                    .await
                }
            }
            .context("failed to load branch segment")?;

            for row in rows {
                history.push(row_to_message(row)?);
            }
        }

        Ok(history)
    }
}

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> Result<ConversationRow> {
    Ok(ConversationRow {
        id: row
            .try_get::<String, _>("id")?
            .parse()
            .context("invalid conversation id")?,
        channel_id: row
            .try_get::<String, _>("channel_id")?
            .parse()
            .context("invalid channel id")?,
        external_chat_id: row.try_get("external_chat_id")?,
        title: row.try_get("title")?,
        active_branch_id: row
            .try_get::<Option<String>, _>("active_branch_id")?
            .map(|s| s.parse())
            .transpose()
            .context("invalid active branch id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_branch(row: sqlx::sqlite::SqliteRow) -> Result<BranchRow> {
    Ok(BranchRow {
        id: row
            .try_get::<String, _>("id")?
            .parse()
            .context("invalid branch id")?,
        conversation_id: row
            .try_get::<String, _>("conversation_id")?
            .parse()
            .context("invalid conversation id")?,
        parent_branch_id: row
            .try_get::<Option<String>, _>("parent_branch_id")?
            .map(|s| s.parse())
            .transpose()
            .context("invalid parent branch id")?,
        branch_point_message_id: row.try_get("branch_point_message_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<MessageRow> {
    let role: String = row.try_get("role")?;
    let inbound_channel_type: Option<String> = row.try_get("inbound_channel_type")?;
    Ok(MessageRow {
        id: row.try_get("id")?,
        conversation_id: row
            .try_get::<String, _>("conversation_id")?
            .parse()
            .context("invalid conversation id")?,
        branch_id: row
            .try_get::<String, _>("branch_id")?
            .parse()
            .context("invalid branch id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        inbound_channel_type: inbound_channel_type.map(|s| parse_channel_type(&s)).transpose()?,
        external_sender: row.try_get("external_sender")?,
        created_at: row.try_get("created_at")?,
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
