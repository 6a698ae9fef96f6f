//! Email channel adapter: IMAP polling for inbound, SMTP for outbound.
//!
//! `imap` is a blocking client, so the poll loop runs on a dedicated
//! blocking thread via `spawn_blocking` and bridges into the async world
//! through a channel; `lettre`'s Tokio-executor transport handles
//! outbound sends natively. Inbound dedup is UID-based: the loop only
//! considers messages with a UID greater than the highest one it has
//! already forwarded, mirroring the update-offset dedup the Telegram
//! adapter uses for the same problem.

use crate::messaging::traits::{InboundStream, Messaging, StatusUpdate};
use crate::{ChannelType as GatewayChannelType, IncomingMessage, OutboundResponse};

use anyhow::Context as _;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as SmtpMessage, Tokio1Executor};
use tokio::sync::mpsc;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Clone, serde::Deserialize)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

pub struct EmailAdapter {
    config: EmailConfig,
    ctx: crate::AppContext,
    smtp: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailAdapter {
    pub fn new(config: EmailConfig, ctx: crate::AppContext) -> anyhow::Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let smtp = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .context("failed to build SMTP transport")?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        Ok(Self { config, ctx, smtp })
    }
}

impl Messaging for EmailAdapter {
    fn name(&self) -> &str {
        "email"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let channel_row = self.ctx.db.channels().get_or_create_by_type(GatewayChannelType::Email).await?;
        let gateway_channel_id = channel_row.id;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || imap_poll_loop(config, gateway_channel_id, inbound_tx));

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(inbound_rx)))
    }

    async fn respond(&self, message: &IncomingMessage, response: OutboundResponse) -> crate::Result<()> {
        let body = match response {
            OutboundResponse::Text(text) => text,
            OutboundResponse::File { filename, caption, .. } => caption.unwrap_or_else(|| format!("[file: {filename}]")),
            OutboundResponse::ApprovalPrompt { tool_name, risk_level, summary, approval_id } => format!(
                "Approval needed: {tool_name} ({risk_level})\n{summary}\n\nReply with /approve {approval_id} or /reject {approval_id}"
            ),
        };

        let email = SmtpMessage::builder()
            .from(self.config.from_address.parse().context("invalid from address").map_err(crate::error::AgentError::Other)?)
            .to(message.external_chat_id.parse().context("invalid recipient address").map_err(crate::error::AgentError::Other)?)
            .subject("Re: your message")
            .body(body)
            .context("failed to build email")
            .map_err(crate::error::AgentError::Other)?;

        self.smtp
            .send(email)
            .await
            .context("failed to send email")
            .map_err(crate::error::AgentError::Other)?;

        Ok(())
    }

    async fn send_status(&self, _message: &IncomingMessage, _status: StatusUpdate) -> crate::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        Ok(())
    }
}

fn imap_poll_loop(config: EmailConfig, gateway_channel_id: crate::ChannelId, inbound_tx: mpsc::Sender<IncomingMessage>) {
    let mut last_seen_uid: u32 = 0;

    loop {
        match poll_once(&config, last_seen_uid, gateway_channel_id, &inbound_tx) {
            Ok(Some(new_uid)) => last_seen_uid = new_uid,
            Ok(None) => {}
            Err(error) => tracing::warn!(%error, "imap poll failed, will retry"),
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn poll_once(
    config: &EmailConfig,
    last_seen_uid: u32,
    gateway_channel_id: crate::ChannelId,
    inbound_tx: &mpsc::Sender<IncomingMessage>,
) -> anyhow::Result<Option<u32>> {
    let tls = native_tls::TlsConnector::builder().build().context("failed to build TLS connector")?;
    let client = imap::ClientBuilder::new(&config.imap_host, config.imap_port)
        .connect()
        .context("failed to connect to IMAP server")?;
    let mut session = client
        .login(&config.username, &config.password)
        .map_err(|(error, _)| error)
        .context("IMAP login failed")?;
    session.select("INBOX").context("failed to select INBOX")?;

    let search = format!("{}:*", last_seen_uid.saturating_add(1));
    let uids = session.uid_search(&search).context("IMAP UID search failed")?;

    let mut max_uid = last_seen_uid;
    let mut uids: Vec<u32> = uids.into_iter().filter(|uid| *uid > last_seen_uid).collect();
    uids.sort_unstable();

    for uid in uids {
        let fetched = session.uid_fetch(uid.to_string(), "RFC822").context("IMAP fetch failed")?;
        let Some(message) = fetched.iter().next() else { continue };
        let Some(body) = message.body() else { continue };

        let parsed = match mailparse::parse_mail(body) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(%error, uid, "failed to parse email body");
                max_uid = max_uid.max(uid);
                continue;
            }
        };

        let from = parsed
            .headers
            .get_first_value("From")
            .unwrap_or_else(|| "unknown".to_string());
        let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
        let text = parsed.get_body().unwrap_or_default();

        let incoming = IncomingMessage {
            channel_id: gateway_channel_id,
            channel_type: GatewayChannelType::Email,
            external_chat_id: from.clone(),
            sender: from,
            text,
            chat_title: Some(subject),
            attachments: Vec::new(),
        };

        if inbound_tx.blocking_send(incoming).is_err() {
            break;
        }
        max_uid = max_uid.max(uid);
    }

    let _ = session.logout();
    drop(tls);

    Ok(if max_uid > last_seen_uid { Some(max_uid) } else { None })
}
