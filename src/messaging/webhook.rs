//! Generic JSON webhook outbound adapter.
//!
//! The inbound half of this channel is a plain HTTP request/response
//! cycle handled directly by the API layer (`api::webhook::generic_webhook`)
//! — a synchronous call gets its reply in the HTTP response body and
//! never reaches this adapter. This adapter only matters for the async
//! mode: when a caller posted `"async": true`, the agent's eventual
//! reply has nowhere to ride back on, so it is POSTed to the callback
//! URL recorded on the channel's config at registration time.

use crate::messaging::traits::{InboundStream, Messaging, StatusUpdate};
use crate::{IncomingMessage, OutboundResponse};

#[derive(Debug, serde::Serialize)]
struct CallbackPayload<'a> {
    external_chat_id: &'a str,
    sender: &'a str,
    reply: String,
}

pub struct WebhookAdapter {
    ctx: crate::AppContext,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(ctx: crate::AppContext) -> Self {
        Self { ctx, client: reqwest::Client::new() }
    }
}

impl Messaging for WebhookAdapter {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let text = match response {
            OutboundResponse::Text(text) => text,
            OutboundResponse::File { filename, caption, .. } => caption.unwrap_or_else(|| format!("[file: {filename}]")),
            OutboundResponse::ApprovalPrompt { tool_name, risk_level, summary, .. } => {
                format!("Approval needed: {tool_name} ({risk_level})\n{summary}")
            }
        };

        let Some(channel) = self.ctx.db.channels().get(message.channel_id).await? else {
            return Ok(());
        };
        let Some(callback_url) = channel.config.get("callback_url").and_then(|v| v.as_str()) else {
            tracing::debug!(channel_id = %message.channel_id, "no callback_url configured for async webhook reply");
            return Ok(());
        };

        let payload = CallbackPayload { external_chat_id: &message.external_chat_id, sender: &message.sender, reply: text };

        if let Err(error) = self.client.post(callback_url).json(&payload).send().await {
            tracing::warn!(%error, %callback_url, "failed to deliver async webhook callback");
        }

        Ok(())
    }

    async fn send_status(&self, _message: &IncomingMessage, _status: StatusUpdate) -> crate::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        Ok(())
    }
}
