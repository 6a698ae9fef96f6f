//! Slack messaging adapter using slack-morphism (Socket Mode).

use crate::messaging::traits::{chunk_text, InboundStream, Messaging, StatusUpdate};
use crate::{ChannelType as GatewayChannelType, IncomingMessage, OutboundResponse};

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

const SLACK_CHUNK_LIMIT: usize = 3000;

/// State handed to socket-mode callbacks via `SlackClientEventsUserState`.
struct SlackAdapterState {
    inbound_tx: mpsc::Sender<IncomingMessage>,
    bot_user_id: String,
    ctx: crate::AppContext,
    gateway_channel_id: crate::ChannelId,
}

pub struct SlackAdapter {
    app_token: String,
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    ctx: crate::AppContext,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>, ctx: crate::AppContext) -> anyhow::Result<Self> {
        let bot_token = bot_token.into();
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token));
        Ok(Self {
            app_token: app_token.into(),
            client,
            token,
            ctx,
            shutdown_tx: Arc::new(RwLock::new(None)),
        })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(msg_event) = event.event else {
        return Ok(());
    };
    if msg_event.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    let user_id = msg_event.sender.user.as_ref().map(|u| u.0.clone());
    if user_id.as_deref() == Some(&adapter_state.bot_user_id) || user_id.is_none() {
        return Ok(());
    }

    let channel_id = msg_event.origin.channel.as_ref().map(|c| c.0.clone()).unwrap_or_default();
    let text = match &msg_event.content {
        Some(content) => content.text.clone().unwrap_or_default(),
        None => String::new(),
    };

    let incoming = IncomingMessage {
        channel_id: adapter_state.gateway_channel_id,
        channel_type: GatewayChannelType::Slack,
        external_chat_id: channel_id,
        sender: user_id.unwrap_or_default(),
        text,
        chat_title: None,
        attachments: Vec::new(),
    };

    let _ = adapter_state.inbound_tx.send(incoming).await;
    Ok(())
}

async fn handle_interaction_event(
    event: SlackInteractionEvent,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackInteractionEvent::BlockActions(block_actions) = event else {
        return Ok(());
    };

    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    let user_id = block_actions.user.as_ref().map(|u| u.id.0.clone()).unwrap_or_default();
    let actions = block_actions.actions.unwrap_or_default();

    for action in &actions {
        let action_id = action.action_id.0.clone();
        let (approved, id_str) = if let Some(rest) = action_id.strip_prefix("approve:") {
            (true, rest)
        } else if let Some(rest) = action_id.strip_prefix("reject:") {
            (false, rest)
        } else {
            continue;
        };
        let Ok(approval_id) = id_str.parse::<crate::ApprovalId>() else { continue };

        if let Err(error) = adapter_state.ctx.hitl.respond(approval_id, approved, &user_id, None).await {
            tracing::warn!(%error, %approval_id, "failed to record slack approval decision");
        }
    }

    Ok(())
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

/// Build a plain-text content block with an inline approve/reject button
/// pair via raw Block Kit JSON, which `SlackMessageContent::with_blocks`
/// accepts after deserialization — simpler than the typed button builders
/// for a one-off two-button row.
fn approval_blocks(approval_id: crate::ApprovalId) -> Vec<SlackBlock> {
    let value = serde_json::json!([
        {
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "text": {"type": "plain_text", "text": "Approve"},
                    "style": "primary",
                    "action_id": format!("approve:{approval_id}"),
                    "value": approval_id.to_string(),
                },
                {
                    "type": "button",
                    "text": {"type": "plain_text", "text": "Reject"},
                    "style": "danger",
                    "action_id": format!("reject:{approval_id}"),
                    "value": approval_id.to_string(),
                }
            ]
        }
    ]);
    serde_json::from_value(value).unwrap_or_default()
}

impl Messaging for SlackAdapter {
    fn name(&self) -> &str {
        "slack"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let channel_row = self.ctx.db.channels().get_or_create_by_type(GatewayChannelType::Slack).await?;

        let auth_response = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")
            .map_err(crate::error::AgentError::Other)?;
        let bot_user_id = auth_response.user_id.0.clone();

        let adapter_state = Arc::new(SlackAdapterState {
            inbound_tx,
            bot_user_id,
            ctx: self.ctx.clone(),
            gateway_channel_id: channel_row.id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_push_events(handle_push_event)
            .with_interaction_events(handle_interaction_event);

        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .context("failed to create slack socket mode connector")
                .map_err(crate::error::AgentError::Other)?,
        ));

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client.clone())
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(&SlackClientSocketModeConfig::new(), listener_environment, callbacks);

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }
            tokio::select! {
                exit_code = listener.serve() => {
                    tracing::info!(exit_code, "slack socket mode listener stopped");
                }
                _ = shutdown_rx.recv() => {
                    listener.shutdown().await;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(inbound_rx)))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let session = self.session();
        let channel_id = SlackChannelId(message.external_chat_id.clone());

        match response {
            OutboundResponse::Text(text) => {
                for chunk in chunk_text(&text, SLACK_CHUNK_LIMIT) {
                    let req = SlackApiChatPostMessageRequest::new(channel_id.clone(), SlackMessageContent::new().with_text(chunk));
                    session
                        .chat_post_message(&req)
                        .await
                        .context("failed to send slack message")
                        .map_err(crate::error::AgentError::Other)?;
                }
            }
            OutboundResponse::File { filename, data, mime_type, caption } => {
                let upload_url_response = session
                    .get_upload_url_external(&SlackApiFilesGetUploadUrlExternalRequest::new(filename.clone(), data.len()))
                    .await
                    .context("failed to get slack upload URL")
                    .map_err(crate::error::AgentError::Other)?;

                session
                    .files_upload_via_url(&SlackApiFilesUploadViaUrlRequest::new(upload_url_response.upload_url, data, mime_type))
                    .await
                    .context("failed to upload file to slack")
                    .map_err(crate::error::AgentError::Other)?;

                let file_complete = SlackApiFilesComplete::new(upload_url_response.file_id).with_title(filename);
                let mut complete_request =
                    SlackApiFilesCompleteUploadExternalRequest::new(vec![file_complete]).with_channel_id(channel_id.clone());
                complete_request = complete_request.opt_initial_comment(caption);
                session
                    .files_complete_upload_external(&complete_request)
                    .await
                    .context("failed to complete slack file upload")
                    .map_err(crate::error::AgentError::Other)?;
            }
            OutboundResponse::ApprovalPrompt { approval_id, tool_name, risk_level, summary } => {
                let text = format!("Approval needed: `{tool_name}` ({risk_level})\n{summary}");
                let content = SlackMessageContent::new().with_text(text).with_blocks(approval_blocks(approval_id));
                let req = SlackApiChatPostMessageRequest::new(channel_id, content);
                session
                    .chat_post_message(&req)
                    .await
                    .context("failed to send slack approval prompt")
                    .map_err(crate::error::AgentError::Other)?;
            }
        }

        Ok(())
    }

    async fn send_status(&self, _message: &IncomingMessage, _status: StatusUpdate) -> crate::Result<()> {
        // Typing-style status in Slack is only available inside Assistant
        // threads via `assistant.threads.setStatus`; ordinary channel
        // messages have no equivalent, so this is a no-op.
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        self.session()
            .auth_test()
            .await
            .map(|_| ())
            .context("slack auth.test failed")
            .map_err(|e| crate::error::AgentError::Other(e).into())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_blocks_parse_into_two_buttons() {
        let id = crate::ApprovalId::new_v4();
        let blocks = approval_blocks(id);
        assert_eq!(blocks.len(), 1);
    }
}
