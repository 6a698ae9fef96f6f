//! Discord messaging adapter using serenity.

use crate::messaging::traits::{chunk_text, InboundStream, Messaging, StatusUpdate};
use crate::{Attachment as GatewayAttachment, ChannelType as GatewayChannelType, IncomingMessage, OutboundResponse};

use anyhow::Context as _;
use serenity::all::{
    ButtonStyle, ChannelId, Context, CreateActionRow, CreateAttachment, CreateButton,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage, EventHandler,
    GatewayIntents, Http, Interaction, Message, Ready,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

const DISCORD_CHUNK_LIMIT: usize = 1990;

/// Discord adapter state.
pub struct DiscordAdapter {
    token: String,
    ctx: crate::AppContext,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    /// Discord channel ids keyed by the conversation's external chat id,
    /// so `respond` can find where to send without re-parsing metadata.
    channel_by_chat: Arc<RwLock<HashMap<String, ChannelId>>>,
    typing_tasks: Arc<RwLock<HashMap<String, serenity::http::Typing>>>,
}

impl DiscordAdapter {
    pub fn new(token: impl Into<String>, ctx: crate::AppContext) -> Self {
        Self {
            token: token.into(),
            ctx,
            http: Arc::new(RwLock::new(None)),
            channel_by_chat: Arc::new(RwLock::new(HashMap::new())),
            typing_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_http(&self) -> anyhow::Result<Arc<Http>> {
        self.http.read().await.clone().context("discord not connected")
    }

    async fn channel_for(&self, message: &IncomingMessage) -> anyhow::Result<ChannelId> {
        self.channel_by_chat
            .read()
            .await
            .get(&message.external_chat_id)
            .copied()
            .context("no known discord channel for this conversation")
    }
}

impl Messaging for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let channel_row = self.ctx.db.channels().get_or_create_by_type(GatewayChannelType::Discord).await?;

        let handler = Handler {
            inbound_tx,
            channel_by_chat: self.channel_by_chat.clone(),
            ctx: self.ctx.clone(),
            gateway_channel_id: channel_row.id,
        };

        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.http.write().await = Some(client.http.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let http = self.get_http().await.map_err(crate::error::AgentError::Other)?;
        let channel_id = self.channel_for(message).await.map_err(crate::error::AgentError::Other)?;

        self.typing_tasks.write().await.remove(&message.external_chat_id);

        match response {
            OutboundResponse::Text(text) => {
                for chunk in chunk_text(&text, DISCORD_CHUNK_LIMIT) {
                    channel_id
                        .say(&*http, &chunk)
                        .await
                        .context("failed to send discord message")
                        .map_err(crate::error::AgentError::Other)?;
                }
            }
            OutboundResponse::File { filename, data, caption, .. } => {
                let attachment = CreateAttachment::bytes(data, &filename);
                let mut builder = CreateMessage::new().add_file(attachment);
                if let Some(caption) = caption {
                    builder = builder.content(caption);
                }
                channel_id
                    .send_message(&*http, builder)
                    .await
                    .context("failed to send discord file")
                    .map_err(crate::error::AgentError::Other)?;
            }
            OutboundResponse::ApprovalPrompt {
                approval_id,
                tool_name,
                risk_level,
                summary,
            } => {
                let row = CreateActionRow::Buttons(vec![
                    CreateButton::new(format!("approve:{approval_id}"))
                        .label("Approve")
                        .style(ButtonStyle::Success),
                    CreateButton::new(format!("reject:{approval_id}"))
                        .label("Reject")
                        .style(ButtonStyle::Danger),
                ]);
                let content = format!("Approval needed: `{tool_name}` ({risk_level})\n{summary}");
                let builder = CreateMessage::new().content(content).components(vec![row]);
                channel_id
                    .send_message(&*http, builder)
                    .await
                    .context("failed to send discord approval prompt")
                    .map_err(crate::error::AgentError::Other)?;
            }
        }

        Ok(())
    }

    async fn send_status(&self, message: &IncomingMessage, status: StatusUpdate) -> crate::Result<()> {
        let http = match self.get_http().await {
            Ok(http) => http,
            Err(_) => return Ok(()),
        };
        let Ok(channel_id) = self.channel_for(message).await else {
            return Ok(());
        };

        match status {
            StatusUpdate::Thinking => {
                if let Ok(typing) = channel_id.start_typing(&http).context("typing") {
                    self.typing_tasks.write().await.insert(message.external_chat_id.clone(), typing);
                }
            }
            StatusUpdate::StopTyping => {
                self.typing_tasks.write().await.remove(&message.external_chat_id);
            }
            StatusUpdate::ToolStarted { .. } | StatusUpdate::ToolCompleted { .. } => {}
        }
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        self.get_http().await.map(|_| ()).map_err(|e| crate::error::AgentError::Other(e).into())
    }
}

struct Handler {
    inbound_tx: mpsc::Sender<IncomingMessage>,
    channel_by_chat: Arc<RwLock<HashMap<String, ChannelId>>>,
    ctx: crate::AppContext,
    gateway_channel_id: crate::ChannelId,
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(bot = %ready.user.name, "discord gateway connected");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let chat_id = msg.channel_id.to_string();
        self.channel_by_chat.write().await.insert(chat_id.clone(), msg.channel_id);

        let incoming = IncomingMessage {
            channel_id: self.gateway_channel_id,
            channel_type: GatewayChannelType::Discord,
            external_chat_id: chat_id,
            sender: msg.author.name.clone(),
            text: msg.content.clone(),
            chat_title: None,
            attachments: msg
                .attachments
                .iter()
                .map(|a| GatewayAttachment {
                    filename: a.filename.clone(),
                    mime_type: a.content_type.clone().unwrap_or_default(),
                    url: a.url.clone(),
                    size_bytes: Some(a.size as u64),
                })
                .collect(),
        };

        let _ = self.inbound_tx.send(incoming).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Component(component) = interaction else { return };
        let custom_id = component.data.custom_id.clone();

        let (approved, id_str) = if let Some(rest) = custom_id.strip_prefix("approve:") {
            (true, rest)
        } else if let Some(rest) = custom_id.strip_prefix("reject:") {
            (false, rest)
        } else {
            return;
        };

        let Ok(approval_id) = id_str.parse::<crate::ApprovalId>() else { return };
        let responder = component.user.name.clone();

        let ack_text = match self.ctx.hitl.respond(approval_id, approved, &responder, None).await {
            Ok(()) => format!("{} by {responder}", if approved { "Approved" } else { "Rejected" }),
            Err(error) => format!("Could not record decision: {error}"),
        };

        let ack = CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(ack_text));
        if let Err(error) = component.create_response(&ctx.http, ack).await {
            tracing::warn!(%error, "failed to acknowledge discord approval button");
        }
    }
}
