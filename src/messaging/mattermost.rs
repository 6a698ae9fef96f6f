//! Mattermost slash-command outbound adapter.
//!
//! Like the generic webhook channel, Mattermost has no persistent
//! connection: the inbound half is an HTTP endpoint
//! (`api::webhook::mattermost_command`) that Mattermost's 3-second ack
//! window forces to respond immediately with an ephemeral "Thinking..."
//! message. The agent's real reply is delivered out-of-band to the
//! `response_url` Mattermost included in the slash-command payload, which
//! this adapter POSTs to once the turn completes.

use crate::messaging::traits::{InboundStream, Messaging, StatusUpdate};
use crate::{IncomingMessage, OutboundResponse};

#[derive(Debug, serde::Serialize)]
struct MattermostResponseUrlPayload {
    response_type: &'static str,
    text: String,
}

pub struct MattermostAdapter {
    ctx: crate::AppContext,
    client: reqwest::Client,
}

impl MattermostAdapter {
    pub fn new(ctx: crate::AppContext) -> Self {
        Self { ctx, client: reqwest::Client::new() }
    }
}

impl Messaging for MattermostAdapter {
    fn name(&self) -> &str {
        "mattermost"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let text = match response {
            OutboundResponse::Text(text) => text,
            OutboundResponse::File { filename, caption, .. } => caption.unwrap_or_else(|| format!("[file: {filename}]")),
            OutboundResponse::ApprovalPrompt { tool_name, risk_level, summary, .. } => {
                format!("Approval needed: `{tool_name}` ({risk_level})\n{summary}")
            }
        };

        let Some(channel) = self.ctx.db.channels().get(message.channel_id).await? else {
            return Ok(());
        };
        let Some(response_url) = channel.config.get("response_url").and_then(|v| v.as_str()) else {
            tracing::debug!(channel_id = %message.channel_id, "no response_url recorded for mattermost reply");
            return Ok(());
        };

        let payload = MattermostResponseUrlPayload { response_type: "in_channel", text };
        if let Err(error) = self.client.post(response_url).json(&payload).send().await {
            tracing::warn!(%error, "failed to deliver mattermost response_url reply");
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
