//! WhatsApp Cloud API outbound adapter with connection-health monitoring.
//!
//! Unlike a Baileys-style multi-device session, the Cloud API is plain
//! REST: there's no socket to keep open, and inbound messages arrive at
//! a webhook endpoint (`api::webhook`, receiving Meta's `POST` callback)
//! rather than through this adapter's `start()`. What this adapter owns
//! is outbound delivery and a background loop that periodically
//! verifies the access token still works, publishing the same
//! connect/reconnect state transitions a socket-based adapter would:
//! an expired/revoked token behaves like `loggedOut` (stop retrying,
//! surface an error state that needs fresh credentials), a transient
//! 5xx behaves like `restartRequired` (retry soon), and a disallowed
//! method/endpoint misconfiguration behaves like the unofficial
//! protocol's `405` (credentials are wrong, not just stale).

use crate::messaging::traits::{InboundStream, Messaging, StatusUpdate};
use crate::{ChannelType as GatewayChannelType, ConnectionStatus, GatewayEvent, IncomingMessage, OutboundResponse};

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const MAX_RETRY_BUDGET: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectOutcome {
    Healthy,
    LoggedOut,
    RestartRequired,
    CredentialsInvalid,
    Backoff,
}

pub struct WhatsAppAdapter {
    ctx: crate::AppContext,
    client: reqwest::Client,
    phone_number_id: String,
    access_token: String,
    status: Arc<ArcSwap<ConnectionStatus>>,
}

impl WhatsAppAdapter {
    pub fn new(phone_number_id: impl Into<String>, access_token: impl Into<String>, ctx: crate::AppContext) -> Self {
        Self {
            ctx,
            client: reqwest::Client::new(),
            phone_number_id: phone_number_id.into(),
            access_token: access_token.into(),
            status: Arc::new(ArcSwap::from_pointee(ConnectionStatus::Disconnected)),
        }
    }

    async fn check_token(&self) -> ReconnectOutcome {
        let url = format!("{GRAPH_API_BASE}/{}", self.phone_number_id);
        match self.client.get(&url).bearer_auth(&self.access_token).send().await {
            Ok(resp) if resp.status().is_success() => ReconnectOutcome::Healthy,
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => ReconnectOutcome::LoggedOut,
            Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => ReconnectOutcome::CredentialsInvalid,
            Ok(resp) if resp.status().is_server_error() => ReconnectOutcome::RestartRequired,
            Ok(_) => ReconnectOutcome::Backoff,
            Err(_) => ReconnectOutcome::Backoff,
        }
    }
}

impl Messaging for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let channel_row = self.ctx.db.channels().get_or_create_by_type(GatewayChannelType::Whatsapp).await?;
        let channel_id = channel_row.id;

        let status = self.status.clone();
        let ctx = self.ctx.clone();
        let client = self.client.clone();
        let phone_number_id = self.phone_number_id.clone();
        let access_token = self.access_token.clone();

        tokio::spawn(async move {
            let mut retry_budget = MAX_RETRY_BUDGET;
            let mut backoff = Duration::from_secs(1);

            loop {
                status.store(Arc::new(ConnectionStatus::Connecting));

                let url = format!("{GRAPH_API_BASE}/{phone_number_id}");
                let outcome = match client.get(&url).bearer_auth(&access_token).send().await {
                    Ok(resp) if resp.status().is_success() => ReconnectOutcome::Healthy,
                    Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => ReconnectOutcome::LoggedOut,
                    Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                        ReconnectOutcome::CredentialsInvalid
                    }
                    Ok(resp) if resp.status().is_server_error() => ReconnectOutcome::RestartRequired,
                    _ => ReconnectOutcome::Backoff,
                };

                match outcome {
                    ReconnectOutcome::Healthy => {
                        status.store(Arc::new(ConnectionStatus::Connected));
                        ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                            channel_id,
                            status: ConnectionStatus::Connected,
                            last_error: None,
                        });
                        retry_budget = MAX_RETRY_BUDGET;
                        backoff = Duration::from_secs(1);
                        tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                    }
                    ReconnectOutcome::LoggedOut => {
                        status.store(Arc::new(ConnectionStatus::Error));
                        ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                            channel_id,
                            status: ConnectionStatus::Error,
                            last_error: Some("access token rejected; re-authentication required".to_string()),
                        });
                        tracing::error!("whatsapp access token logged out, stopping health checks");
                        return;
                    }
                    ReconnectOutcome::CredentialsInvalid => {
                        status.store(Arc::new(ConnectionStatus::Error));
                        ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                            channel_id,
                            status: ConnectionStatus::Error,
                            last_error: Some("phone_number_id/access_token misconfigured".to_string()),
                        });
                        tracing::error!("whatsapp credentials invalid, stopping health checks");
                        return;
                    }
                    ReconnectOutcome::RestartRequired => {
                        tracing::warn!("whatsapp graph API returned a server error, retrying shortly");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    ReconnectOutcome::Backoff => {
                        retry_budget = retry_budget.saturating_sub(1);
                        if retry_budget == 0 {
                            status.store(Arc::new(ConnectionStatus::Error));
                            ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                                channel_id,
                                status: ConnectionStatus::Error,
                                last_error: Some("retry budget exhausted".to_string()),
                            });
                            tracing::error!("whatsapp reconnect retry budget exhausted, giving up");
                            return;
                        }
                        tracing::warn!(?backoff, "whatsapp health check failed, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        Ok(Box::pin(futures::stream::pending()))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let url = format!("{GRAPH_API_BASE}/{}/messages", self.phone_number_id);

        let body = match response {
            OutboundResponse::Text(text) => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": message.external_chat_id,
                "type": "text",
                "text": {"body": text},
            }),
            OutboundResponse::File { caption, .. } => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": message.external_chat_id,
                "type": "text",
                "text": {"body": caption.unwrap_or_else(|| "[file attached]".to_string())},
            }),
            OutboundResponse::ApprovalPrompt { tool_name, risk_level, summary, approval_id } => serde_json::json!({
                "messaging_product": "whatsapp",
                "to": message.external_chat_id,
                "type": "text",
                "text": {"body": format!(
                    "Approval needed: {tool_name} ({risk_level})\n{summary}\nReply /approve {approval_id} or /reject {approval_id}"
                )},
            }),
        };

        use anyhow::Context as _;

        self.client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .context("failed to send whatsapp message")
            .map_err(crate::error::AgentError::Other)?
            .error_for_status()
            .context("whatsapp graph API rejected the message")
            .map_err(crate::error::AgentError::Other)?;

        Ok(())
    }

    async fn send_status(&self, _message: &IncomingMessage, _status: StatusUpdate) -> crate::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        match self.check_token().await {
            ReconnectOutcome::Healthy => Ok(()),
            _ => Err(crate::error::MessagingError::NotConnected { adapter: "whatsapp".to_string() }.into()),
        }
    }
}
