//! Telegram messaging adapter, built on `teloxide`'s long-polling client.
//!
//! Inbound updates are deduplicated by offset the same way the Bot API
//! itself expects: each `getUpdates` call acks everything up to and
//! including the last offset seen, so a reconnect never redelivers an
//! update already acted on.

use crate::messaging::traits::{chunk_text, InboundStream, Messaging, StatusUpdate};
use crate::{ChannelType as GatewayChannelType, IncomingMessage, OutboundResponse};

use anyhow::Context as _;
use teloxide::payloads::{AnswerCallbackQuerySetters, SendDocumentSetters, SendMessageSetters};
use teloxide::requests::Requester;
use teloxide::types::{
    CallbackQuery, ChatAction, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode, UpdateKind,
};
use teloxide::Bot;
use tokio::sync::mpsc;

const TELEGRAM_CHUNK_LIMIT: usize = 4000;

pub struct TelegramAdapter {
    bot: Bot,
    ctx: crate::AppContext,
}

impl TelegramAdapter {
    pub fn new(token: impl Into<String>, ctx: crate::AppContext) -> Self {
        Self { bot: Bot::new(token.into()), ctx }
    }
}

impl Messaging for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let bot = self.bot.clone();
        let ctx = self.ctx.clone();

        let channel_row = self.ctx.db.channels().get_or_create_by_type(GatewayChannelType::Telegram).await?;
        let gateway_channel_id = channel_row.id;

        tokio::spawn(async move {
            let mut offset: i32 = 0;
            loop {
                let updates = match bot.get_updates().offset(offset).timeout(30_u32).await {
                    Ok(updates) => updates,
                    Err(error) => {
                        tracing::warn!(%error, "telegram getUpdates failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.id.0 as i32 + 1);

                    match update.kind {
                        UpdateKind::Message(message) => {
                            let Some(text) = message.text() else { continue };
                            let incoming = IncomingMessage {
                                channel_id: gateway_channel_id,
                                channel_type: GatewayChannelType::Telegram,
                                external_chat_id: message.chat.id.0.to_string(),
                                sender: message
                                    .from
                                    .as_ref()
                                    .map(|u| u.full_name())
                                    .unwrap_or_else(|| "unknown".to_string()),
                                text: text.to_string(),
                                chat_title: message.chat.title().map(str::to_string),
                                attachments: Vec::new(),
                            };
                            if inbound_tx.send(incoming).await.is_err() {
                                return;
                            }
                        }
                        UpdateKind::CallbackQuery(callback) => {
                            handle_callback(&bot, &ctx, callback).await;
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(inbound_rx)))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let chat_id = ChatId(
            message
                .external_chat_id
                .parse::<i64>()
                .context("invalid telegram chat id")
                .map_err(crate::error::AgentError::Other)?,
        );

        match response {
            OutboundResponse::Text(text) => {
                let html = markdown_to_telegram_html(&text);
                for chunk in chunk_text(&html, TELEGRAM_CHUNK_LIMIT) {
                    let sent = self.bot.send_message(chat_id, &chunk).parse_mode(ParseMode::Html).await;
                    if sent.is_err() {
                        // The HTML subset Telegram accepts is a strict grammar;
                        // if our conversion produced something it rejects, fall
                        // back to the raw text rather than losing the reply.
                        self.bot
                            .send_message(chat_id, &chunk)
                            .await
                            .context("failed to send telegram message")
                            .map_err(crate::error::AgentError::Other)?;
                    }
                }
            }
            OutboundResponse::File { filename, data, caption, .. } => {
                let file = InputFile::memory(data).file_name(filename);
                let mut request = self.bot.send_document(chat_id, file);
                if let Some(caption) = caption {
                    request = request.caption(caption);
                }
                request
                    .await
                    .context("failed to send telegram document")
                    .map_err(crate::error::AgentError::Other)?;
            }
            OutboundResponse::ApprovalPrompt { approval_id, tool_name, risk_level, summary } => {
                let text = format!("Approval needed: <code>{tool_name}</code> ({risk_level})\n{summary}");
                let keyboard = InlineKeyboardMarkup::new(vec![vec![
                    InlineKeyboardButton::callback("Approve", format!("approve:{approval_id}")),
                    InlineKeyboardButton::callback("Reject", format!("reject:{approval_id}")),
                ]]);
                self.bot
                    .send_message(chat_id, text)
                    .parse_mode(ParseMode::Html)
                    .reply_markup(keyboard)
                    .await
                    .context("failed to send telegram approval prompt")
                    .map_err(crate::error::AgentError::Other)?;
            }
        }

        Ok(())
    }

    async fn send_status(&self, message: &IncomingMessage, status: StatusUpdate) -> crate::Result<()> {
        if !matches!(status, StatusUpdate::Thinking) {
            return Ok(());
        }
        let Ok(chat_id) = message.external_chat_id.parse::<i64>() else { return Ok(()) };
        let _ = self.bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await;
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        self.bot
            .get_me()
            .await
            .map(|_| ())
            .context("telegram getMe failed")
            .map_err(|e| crate::error::AgentError::Other(e).into())
    }
}

async fn handle_callback(bot: &Bot, ctx: &crate::AppContext, callback: CallbackQuery) {
    let Some(data) = callback.data.as_deref() else { return };

    let (approved, id_str) = if let Some(rest) = data.strip_prefix("approve:") {
        (true, rest)
    } else if let Some(rest) = data.strip_prefix("reject:") {
        (false, rest)
    } else {
        return;
    };

    let Ok(approval_id) = id_str.parse::<crate::ApprovalId>() else { return };
    let responder = callback.from.full_name();

    let ack_text = match ctx.hitl.respond(approval_id, approved, &responder, None).await {
        Ok(()) => if approved { "Approved" } else { "Rejected" }.to_string(),
        Err(error) => format!("Could not record decision: {error}"),
    };

    if let Err(error) = bot.answer_callback_query(callback.id).text(ack_text).await {
        tracing::warn!(%error, "failed to answer telegram callback query");
    }
}

/// Convert a constrained Markdown subset (bold `**`, italic `_`, inline
/// code `` ` ``, fenced code blocks) to Telegram's HTML parse mode.
/// Code spans are pulled out and replaced with placeholders before the
/// bold/italic passes run, then restored HTML-escaped, so formatting
/// markers inside code never get misinterpreted as Markdown.
fn markdown_to_telegram_html(text: &str) -> String {
    let mut code_blocks = Vec::new();
    let mut working = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '`' {
            if chars.peek() == Some(&'`') {
                chars.next();
                if chars.peek() == Some(&'`') {
                    chars.next();
                    let mut body = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == '`' {
                            break;
                        }
                        body.push(c);
                        chars.next();
                    }
                    for _ in 0..3 {
                        chars.next();
                    }
                    let placeholder = format!("\u{0}CODEBLOCK{}\u{0}", code_blocks.len());
                    let body = body.trim_start_matches(|c: char| c != '\n').trim_start_matches('\n');
                    code_blocks.push(format!("<pre>{}</pre>", html_escape(body)));
                    working.push_str(&placeholder);
                    continue;
                }
            }
            let mut body = String::new();
            while let Some(&c) = chars.peek() {
                if c == '`' {
                    chars.next();
                    break;
                }
                body.push(c);
                chars.next();
            }
            let placeholder = format!("\u{0}CODE{}\u{0}", code_blocks.len());
            code_blocks.push(format!("<code>{}</code>", html_escape(&body)));
            working.push_str(&placeholder);
            continue;
        }
        working.push(c);
    }

    let mut html = html_escape(&working);
    html = replace_paired(&html, "**", "<b>", "</b>");
    html = replace_paired(&html, "_", "<i>", "</i>");

    for (i, block) in code_blocks.iter().enumerate() {
        html = html.replace(&format!("\u{0}CODEBLOCK{i}\u{0}"), block);
        html = html.replace(&format!("\u{0}CODE{i}\u{0}"), block);
    }

    html
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn replace_paired(s: &str, marker: &str, open: &str, close: &str) -> String {
    let parts: Vec<&str> = s.split(marker).collect();
    if parts.len() < 3 {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(if i % 2 == 1 { open } else { close });
        }
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_and_italic_convert_to_html() {
        assert_eq!(markdown_to_telegram_html("**hi**"), "<b>hi</b>");
        assert_eq!(markdown_to_telegram_html("_hi_"), "<i>hi</i>");
    }

    #[test]
    fn inline_code_is_protected_from_emphasis_passes() {
        let out = markdown_to_telegram_html("`**not bold**`");
        assert_eq!(out, "<code>**not bold**</code>");
    }

    #[test]
    fn plain_text_passes_through_escaped() {
        assert_eq!(markdown_to_telegram_html("a < b"), "a &lt; b");
    }
}
