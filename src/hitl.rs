//! Human-in-the-loop approval gating for risky tool calls.
//!
//! Every approval is first a durable row (survives a restart while a
//! request is in flight) and second an in-memory rendezvous: the agent
//! loop calls [`ApprovalManager::request_approval`] and blocks on a
//! oneshot receiver that is completed either by a channel adapter
//! relaying a human's response, or by the manager's own timeout sweep —
//! whichever happens first wins, the other is simply dropped.

use crate::db::models::{ApprovalRow, ApprovalStatus, RiskLevel};
use crate::error::{HitlError, Result};
use crate::{ApprovalId, ChannelType, ConversationId, IncomingMessage, OutboundResponse, RunId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A human's decision on a pending approval.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub responder_id: String,
    pub reason: Option<String>,
}

struct Waiter {
    sender: oneshot::Sender<ApprovalDecision>,
    timeout_handle: JoinHandle<()>,
}

pub struct ApprovalManager {
    db: crate::db::Db,
    event_bus: crate::event_bus::EventBus,
    waiters: Mutex<HashMap<ApprovalId, Waiter>>,
    defaults: crate::config::HitlDefaults,
    // Bound once at startup; see `ConversationRouter`'s field of the same
    // name for why this can't be supplied at construction time.
    manager: OnceLock<Arc<crate::messaging::MessagingManager>>,
}

impl ApprovalManager {
    pub fn new(
        db: crate::db::Db,
        event_bus: crate::event_bus::EventBus,
        defaults: crate::config::HitlDefaults,
    ) -> Self {
        Self {
            db,
            event_bus,
            waiters: Mutex::new(HashMap::new()),
            defaults,
            manager: OnceLock::new(),
        }
    }

    pub fn bind_manager(&self, manager: Arc<crate::messaging::MessagingManager>) {
        let _ = self.manager.set(manager);
    }

    /// Relay the approval prompt to the conversation's originating
    /// channel. Best-effort: a lookup or delivery failure is logged and
    /// swallowed, since the row itself is already durable and `/approve`
    /// or `/reject` can still resolve it out of band.
    async fn notify_channel(
        &self,
        conversation_id: ConversationId,
        channel_type: ChannelType,
        approval_id: ApprovalId,
        tool_name: &str,
        risk_level: RiskLevel,
    ) {
        let Some(manager) = self.manager.get() else {
            return;
        };
        let conversation = match self.db.conversations().get(conversation_id).await {
            Ok(Some(c)) => c,
            _ => return,
        };
        let channel = match self.db.channels().get(conversation.channel_id).await {
            Ok(Some(c)) => c,
            _ => return,
        };
        let incoming = IncomingMessage {
            channel_id: channel.id,
            channel_type,
            external_chat_id: conversation.external_chat_id,
            sender: String::new(),
            text: String::new(),
            chat_title: conversation.title,
            attachments: Vec::new(),
        };
        let response = OutboundResponse::ApprovalPrompt {
            approval_id,
            tool_name: tool_name.to_string(),
            risk_level: risk_level.as_str().to_string(),
            summary: format!("Approve running `{tool_name}`?"),
        };
        if let Err(error) = manager.respond(channel_type, &incoming, response).await {
            tracing::error!(%error, %approval_id, "failed to deliver approval prompt");
        }
    }

    /// Whether a tool call at this risk tier needs a human response before
    /// it proceeds.
    pub fn requires_approval(&self, risk_level: RiskLevel) -> bool {
        !risk_level.auto_approves()
    }

    fn timeout_for(&self, risk_level: RiskLevel) -> Duration {
        match risk_level {
            RiskLevel::Critical => Duration::from_secs(self.defaults.critical_timeout_secs),
            _ => Duration::from_secs(self.defaults.high_timeout_secs),
        }
    }

    /// Create a pending approval row, register its in-memory waiter, and
    /// block until a decision arrives or the timeout elapses. On timeout
    /// the row is marked `timed_out` and the call is treated as rejected.
    pub async fn request_approval(
        &self,
        run_id: RunId,
        conversation_id: ConversationId,
        channel_type: ChannelType,
        tool_name: &str,
        tool_input: &serde_json::Value,
        risk_level: RiskLevel,
    ) -> Result<ApprovalDecision> {
        let timeout = self.timeout_for(risk_level);
        let timeout_at = chrono::Utc::now() + chrono::Duration::from_std(timeout).unwrap();

        let row = self
            .db
            .approvals()
            .create(
                run_id,
                conversation_id,
                channel_type,
                tool_name,
                tool_input,
                risk_level,
                timeout_at,
            )
            .await?;

        self.event_bus.publish(crate::GatewayEvent::ApprovalRequired {
            approval_id: row.id,
            conversation_id,
            tool_name: tool_name.to_string(),
            risk_level: risk_level.as_str().to_string(),
        });
        self.notify_channel(conversation_id, channel_type, row.id, tool_name, risk_level)
            .await;
        #[cfg(feature = "metrics")]
        crate::metrics::Metrics::global().hitl_pending.inc();

        let (tx, rx) = oneshot::channel();
        let approval_id = row.id;
        let timeout_handle = {
            let db = self.db.clone();
            let event_bus = self.event_bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = db
                    .approvals()
                    .respond(approval_id, ApprovalStatus::TimedOut, None, Some("timed out"))
                    .await;
                event_bus.publish(crate::GatewayEvent::ApprovalResolved {
                    approval_id,
                    approved: false,
                    reason: Some("timed out".to_string()),
                });
                #[cfg(feature = "metrics")]
                crate::metrics::Metrics::global().hitl_pending.dec();
            })
        };

        {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.insert(
                approval_id,
                Waiter {
                    sender: tx,
                    timeout_handle,
                },
            );
        }

        match rx.await {
            Ok(decision) => Ok(decision),
            Err(_) => Ok(ApprovalDecision {
                approved: false,
                responder_id: String::new(),
                reason: Some("timed out".to_string()),
            }),
        }
    }

    /// Called by a channel adapter (or the `/approve` / `/reject` slash
    /// command path) when a human responds. Resolves the DB row and wakes
    /// the waiting agent loop, if it's still waiting.
    pub async fn respond(
        &self,
        approval_id: ApprovalId,
        approved: bool,
        responder_id: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let row = self
            .db
            .approvals()
            .get(approval_id)
            .await?
            .ok_or_else(|| HitlError::NotFound {
                id: approval_id.to_string(),
            })?;
        if row.status != ApprovalStatus::Pending {
            return Err(HitlError::AlreadyResolved {
                id: approval_id.to_string(),
            }
            .into());
        }

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.db
            .approvals()
            .respond(approval_id, status, Some(responder_id), reason)
            .await?;

        self.event_bus.publish(crate::GatewayEvent::ApprovalResolved {
            approval_id,
            approved,
            reason: reason.map(str::to_string),
        });
        #[cfg(feature = "metrics")]
        crate::metrics::Metrics::global().hitl_pending.dec();

        if let Some(waiter) = self.waiters.lock().unwrap().remove(&approval_id) {
            waiter.timeout_handle.abort();
            let _ = waiter.sender.send(ApprovalDecision {
                approved,
                responder_id: responder_id.to_string(),
                reason: reason.map(str::to_string),
            });
        }
        Ok(())
    }

    pub async fn get(&self, approval_id: ApprovalId) -> Result<Option<ApprovalRow>> {
        self.db.approvals().get(approval_id).await
    }

    /// Periodic sweep: resolve any `pending` row whose timeout has already
    /// passed but whose in-memory waiter is gone (e.g. after a restart —
    /// the in-process timeout task doesn't survive, so the row would
    /// otherwise stay `pending` forever).
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.db.approvals().list_timed_out().await?;
        let mut n = 0;
        for row in expired {
            if self.waiters.lock().unwrap().contains_key(&row.id) {
                continue; // the in-process timeout task will handle it
            }
            self.db
                .approvals()
                .respond(row.id, ApprovalStatus::TimedOut, None, Some("timed out"))
                .await?;
            self.event_bus.publish(crate::GatewayEvent::ApprovalResolved {
                approval_id: row.id,
                approved: false,
                reason: Some("timed out".to_string()),
            });
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HitlDefaults;

    async fn manager() -> ApprovalManager {
        let db = crate::db::Db::connect_in_memory().await.unwrap();
        ApprovalManager::new(
            db,
            crate::event_bus::EventBus::new(),
            HitlDefaults {
                high_timeout_secs: 1,
                critical_timeout_secs: 2,
            },
        )
    }

    async fn seed_conversation(db: &crate::db::Db) -> (ConversationId, ChannelType) {
        let channel = db
            .channels()
            .create(ChannelType::Webhook, "test", &serde_json::json!({}))
            .await
            .unwrap();
        let conversation = db
            .conversations()
            .get_or_create(channel.id, "chat-1")
            .await
            .unwrap();
        (conversation.id, channel.channel_type)
    }

    #[tokio::test]
    async fn approval_is_resolved_by_explicit_response() {
        let mgr = manager().await;
        let (conversation_id, channel_type) = seed_conversation(&mgr.db).await;
        let run_id = RunId::new_v4();

        let mgr = std::sync::Arc::new(mgr);
        let mgr2 = mgr.clone();
        let handle = tokio::spawn(async move {
            mgr2.request_approval(
                run_id,
                conversation_id,
                channel_type,
                "delete_file",
                &serde_json::json!({"path": "/tmp/x"}),
                RiskLevel::High,
            )
            .await
        });

        // Give the request task a moment to register its waiter.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let approvals = mgr.db.approvals().list_timed_out().await.unwrap();
        assert!(approvals.is_empty());

        let pending = mgr.waiters.lock().unwrap().keys().next().copied();
        let approval_id = pending.expect("waiter registered");
        mgr.respond(approval_id, true, "alice", None).await.unwrap();

        let decision = handle.await.unwrap().unwrap();
        assert!(decision.approved);
        assert_eq!(decision.responder_id, "alice");
    }

    #[tokio::test]
    async fn approval_times_out_without_response() {
        let mgr = manager().await;
        let (conversation_id, channel_type) = seed_conversation(&mgr.db).await;
        let decision = mgr
            .request_approval(
                RunId::new_v4(),
                conversation_id,
                channel_type,
                "delete_file",
                &serde_json::json!({}),
                RiskLevel::High,
            )
            .await
            .unwrap();
        assert!(!decision.approved);
    }
}
