//! Web-widget messaging adapter for browser-based agent interaction.
//!
//! Unlike the other adapters, this one does not own an HTTP server or
//! inbound stream. Inbound messages are handed in directly by the API
//! layer's chat endpoint; outbound responses and status updates are
//! routed to per-session channels that the API layer drains as an SSE
//! stream.

use crate::messaging::traits::{InboundStream, Messaging, StatusUpdate};
use crate::{IncomingMessage, OutboundResponse};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub struct WebChatAdapter {
    sessions: Arc<RwLock<HashMap<String, mpsc::Sender<WebChatEvent>>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub enum WebChatEvent {
    Thinking,
    StopTyping,
    Text(String),
    ApprovalPrompt { approval_id: String, tool_name: String, risk_level: String, summary: String },
    Done,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self { sessions: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn register_session(&self, session_id: &str) -> mpsc::Receiver<WebChatEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.sessions.write().await.insert(session_id.to_string(), tx);
        tracing::debug!(%session_id, "webchat session registered");
        rx
    }

    pub async fn unregister_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        tracing::debug!(%session_id, "webchat session unregistered");
    }
}

impl Messaging for WebChatAdapter {
    fn name(&self) -> &str {
        "web_widget"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let sessions = self.sessions.read().await;
        let Some(tx) = sessions.get(&message.external_chat_id) else {
            tracing::debug!(session_id = %message.external_chat_id, "no webchat session for response");
            return Ok(());
        };

        let event = match response {
            OutboundResponse::Text(text) => WebChatEvent::Text(text),
            OutboundResponse::File { filename, caption, .. } => {
                WebChatEvent::Text(caption.unwrap_or_else(|| format!("[file: {filename}]")))
            }
            OutboundResponse::ApprovalPrompt { approval_id, tool_name, risk_level, summary } => {
                WebChatEvent::ApprovalPrompt {
                    approval_id: approval_id.to_string(),
                    tool_name,
                    risk_level: risk_level.to_string(),
                    summary,
                }
            }
        };

        let _ = tx.send(event).await;
        let _ = tx.send(WebChatEvent::Done).await;
        Ok(())
    }

    async fn send_status(&self, message: &IncomingMessage, status: StatusUpdate) -> crate::Result<()> {
        let sessions = self.sessions.read().await;
        let Some(tx) = sessions.get(&message.external_chat_id) else {
            return Ok(());
        };

        let event = match status {
            StatusUpdate::Thinking => WebChatEvent::Thinking,
            StatusUpdate::StopTyping => WebChatEvent::StopTyping,
            StatusUpdate::ToolStarted { .. } | StatusUpdate::ToolCompleted { .. } => return Ok(()),
        };

        let _ = tx.send(event).await;
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        self.sessions.write().await.clear();
        tracing::info!("webchat adapter shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_with_no_session_does_not_error() {
        let adapter = WebChatAdapter::new();
        let message = IncomingMessage {
            channel_id: crate::ChannelId::new_v4(),
            channel_type: crate::ChannelType::WebWidget,
            external_chat_id: "missing-session".to_string(),
            sender: "alice".to_string(),
            text: "hi".to_string(),
            chat_title: None,
            attachments: Vec::new(),
        };
        adapter.respond(&message, OutboundResponse::Text("hello".to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn registered_session_receives_text_then_done() {
        let adapter = WebChatAdapter::new();
        let mut rx = adapter.register_session("s1").await;
        let message = IncomingMessage {
            channel_id: crate::ChannelId::new_v4(),
            channel_type: crate::ChannelType::WebWidget,
            external_chat_id: "s1".to_string(),
            sender: "alice".to_string(),
            text: "hi".to_string(),
            chat_title: None,
            attachments: Vec::new(),
        };
        adapter.respond(&message, OutboundResponse::Text("hello".to_string())).await.unwrap();
        assert!(matches!(rx.recv().await, Some(WebChatEvent::Text(t)) if t == "hello"));
        assert!(matches!(rx.recv().await, Some(WebChatEvent::Done)));
    }
}
