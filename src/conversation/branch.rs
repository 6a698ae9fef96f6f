//! Conversation branch CRUD — a thin, HTTP/command-friendly layer over
//! [`crate::db::conversations::ConversationStore`]'s branch operations.
//!
//! A branch here is a fork point in one conversation's message tree,
//! switched with `/branch` or similar — not a spawned worker process.

use crate::db::models::BranchRow;
use crate::db::Db;
use crate::error::Result;
use crate::{BranchId, ConversationId};

/// Fork `conversation_id`'s active branch at its most recent message,
/// name the fork, and make it the new active branch.
pub async fn create_and_switch(db: &Db, conversation_id: ConversationId, name: &str) -> Result<BranchRow> {
    let conversation = db
        .conversations()
        .get(conversation_id)
        .await?
        .ok_or_else(|| crate::error::AgentError::ConversationNotFound {
            id: conversation_id.to_string(),
        })?;
    let active_branch_id = conversation
        .active_branch_id
        .ok_or_else(|| crate::error::AgentError::ConversationNotFound {
            id: conversation_id.to_string(),
        })?;

    let history = db.conversations().assemble_branch_history(active_branch_id).await?;
    let branch_point_message_id = history.last().map(|m| m.id).unwrap_or(0);

    let branch = db
        .conversations()
        .create_branch(conversation_id, active_branch_id, branch_point_message_id, name)
        .await?;
    db.conversations().set_active_branch(conversation_id, branch.id).await?;
    Ok(branch)
}

pub async fn switch(db: &Db, conversation_id: ConversationId, branch_id: BranchId) -> Result<()> {
    let branch = db
        .conversations()
        .get_branch(branch_id)
        .await?
        .ok_or_else(|| crate::error::AgentError::BranchNotFound {
            id: branch_id.to_string(),
        })?;
    if branch.conversation_id != conversation_id {
        return Err(crate::error::AgentError::BranchNotFound {
            id: branch_id.to_string(),
        }
        .into());
    }
    db.conversations().set_active_branch(conversation_id, branch_id).await
}

pub async fn list(db: &Db, conversation_id: ConversationId) -> Result<Vec<BranchRow>> {
    db.conversations().list_branches(conversation_id).await
}

pub async fn delete(db: &Db, branch_id: BranchId) -> Result<()> {
    db.conversations().delete_branch(branch_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelType;

    async fn seed(db: &Db) -> ConversationId {
        let channel = db
            .channels()
            .create(ChannelType::Webhook, "test", &serde_json::json!({}))
            .await
            .unwrap();
        let conversation = db.conversations().get_or_create(channel.id, "chat-1").await.unwrap();
        conversation.id
    }

    #[tokio::test]
    async fn create_and_switch_makes_the_fork_active() {
        let db = crate::db::Db::connect_in_memory().await.unwrap();
        let conversation_id = seed(&db).await;
        db.conversations()
            .append_message(
                conversation_id,
                db.conversations().get(conversation_id).await.unwrap().unwrap().active_branch_id.unwrap(),
                crate::db::models::MessageRole::User,
                "hi",
                None,
                None,
            )
            .await
            .unwrap();

        let branch = create_and_switch(&db, conversation_id, "experiment").await.unwrap();
        let conversation = db.conversations().get(conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.active_branch_id, Some(branch.id));
        assert_eq!(branch.name, "experiment");
    }

    #[tokio::test]
    async fn cannot_delete_root_branch() {
        let db = crate::db::Db::connect_in_memory().await.unwrap();
        let conversation_id = seed(&db).await;
        let conversation = db.conversations().get(conversation_id).await.unwrap().unwrap();
        let root = conversation.active_branch_id.unwrap();
        assert!(delete(&db, root).await.is_err());
    }
}
