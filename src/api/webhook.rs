//! Webhook-style inbound channels: Mattermost slash commands and a
//! generic JSON webhook (sync or async reply).

use super::state::ApiState;
use crate::{Attachment, ChannelType, IncomingMessage};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Mattermost slash-command payload, `application/x-www-form-urlencoded`.
#[derive(Debug, Deserialize)]
pub(super) struct MattermostCommand {
    token: String,
    channel_id: String,
    user_name: String,
    text: String,
    response_url: String,
}

#[derive(Debug, Serialize)]
pub(super) struct MattermostResponse {
    response_type: &'static str,
    text: String,
}

/// Mattermost validates slash commands with a per-command token rather
/// than a header; it's checked against the value stashed in the
/// channel's `config` JSON the first time this webhook is provisioned.
///
/// Mattermost expects the HTTP response within 3 seconds, so the agent
/// turn is never awaited inline here: this acks with an ephemeral
/// "Thinking..." and hands the message to the router's async path. The
/// real reply rides back on `response_url`, which `MattermostAdapter`
/// posts to once the turn completes — see `messaging::mattermost`.
pub(super) async fn mattermost_command(
    State(state): State<Arc<ApiState>>,
    axum::Form(payload): axum::Form<MattermostCommand>,
) -> Result<Json<MattermostResponse>, StatusCode> {
    let channel = state
        .ctx
        .db
        .channels()
        .get_or_create_by_type(ChannelType::Mattermost)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(expected) = channel.config.get("token").and_then(|v| v.as_str()) {
        if !expected.is_empty() && expected != payload.token {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let mut config = channel.config.clone();
    config["response_url"] = serde_json::Value::String(payload.response_url.clone());
    state
        .ctx
        .db
        .channels()
        .update_config(channel.id, &config)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let incoming = IncomingMessage {
        channel_id: channel.id,
        channel_type: ChannelType::Mattermost,
        external_chat_id: payload.channel_id,
        sender: payload.user_name,
        text: payload.text,
        chat_title: None,
        attachments: Vec::new(),
    };

    state
        .router
        .handle(incoming)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(MattermostResponse {
        response_type: "ephemeral",
        text: "Thinking...".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct GenericWebhookPayload {
    external_chat_id: String,
    sender: String,
    text: String,
    #[serde(default)]
    r#async: bool,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub(super) struct GenericWebhookReply {
    reply: String,
}

#[derive(Debug, Serialize)]
pub(super) struct GenericWebhookAccepted {
    accepted: bool,
}

/// Generic JSON webhook. A bearer token in `Authorization`, checked
/// against the channel config's `secret`, gates every request; a
/// missing configured secret means the endpoint is open (used in local
/// development only).
pub(super) async fn generic_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(payload): Json<GenericWebhookPayload>,
) -> Result<axum::response::Response, StatusCode> {
    use axum::response::IntoResponse as _;

    let channel = state
        .ctx
        .db
        .channels()
        .get_or_create_by_type(ChannelType::Webhook)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(secret) = channel.config.get("secret").and_then(|v| v.as_str()) {
        if !secret.is_empty() {
            let provided = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if provided != Some(secret) {
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }

    let incoming = IncomingMessage {
        channel_id: channel.id,
        channel_type: ChannelType::Webhook,
        external_chat_id: payload.external_chat_id,
        sender: payload.sender,
        text: payload.text,
        chat_title: None,
        attachments: payload.attachments,
    };

    if payload.r#async {
        state
            .router
            .handle(incoming)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        return Ok((StatusCode::ACCEPTED, Json(GenericWebhookAccepted { accepted: true })).into_response());
    }

    let outcome = state
        .router
        .handle_sync(incoming)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let reply = match outcome {
        crate::agent::TurnOutcome::Replied { text, .. } => text,
        crate::agent::TurnOutcome::Failed { message, .. } => return Err(StatusCode::INTERNAL_SERVER_ERROR.tap_err(&message)),
    };

    Ok(Json(GenericWebhookReply { reply }).into_response())
}

/// `StatusCode` has no `tap_err`; this local extension keeps the
/// failure-path error text in the logs instead of silently dropping it.
trait TapErr {
    fn tap_err(self, message: &str) -> Self;
}

impl TapErr for StatusCode {
    fn tap_err(self, message: &str) -> Self {
        tracing::warn!(%message, "agent turn failed");
        self
    }
}
