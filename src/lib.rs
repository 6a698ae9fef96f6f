//! Loop Gateway: a multi-channel agentic AI gateway.
//!
//! Messages arrive from chat channels, are routed through an LLM-driven
//! agent loop with a pluggable tool/skill system, and are replied to on
//! the originating channel. Human-in-the-loop approval gates risky tool
//! calls; an MCP manager bridges remote tool servers; a container runner
//! isolates each agent invocation in its own sandbox.

pub mod agent;
pub mod api;
pub mod config;
pub mod container_runner;
pub mod conversation;
pub mod db;
pub mod error;
pub mod event_bus;
pub mod hitl;
pub mod llm;
pub mod mcp;
pub mod messaging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod resilience;
pub mod tools;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Channel identifier (primary key of the `channels` table).
pub type ChannelId = uuid::Uuid;

/// Conversation identifier.
pub type ConversationId = uuid::Uuid;

/// Conversation branch identifier.
pub type BranchId = uuid::Uuid;

/// Agent run identifier.
pub type RunId = uuid::Uuid;

/// Approval request identifier.
pub type ApprovalId = uuid::Uuid;

/// The closed set of channel platform types a `Channel` row may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Telegram,
    Whatsapp,
    Email,
    Slack,
    Discord,
    Mattermost,
    Webhook,
    WebWidget,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelType::Telegram => "telegram",
            ChannelType::Whatsapp => "whatsapp",
            ChannelType::Email => "email",
            ChannelType::Slack => "slack",
            ChannelType::Discord => "discord",
            ChannelType::Mattermost => "mattermost",
            ChannelType::Webhook => "webhook",
            ChannelType::WebWidget => "web_widget",
        };
        f.write_str(s)
    }
}

/// Observable adapter connection state, published to the dashboard via
/// [`GatewayEvent::AdapterStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Inbound message normalized from any adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub channel_id: ChannelId,
    pub channel_type: ChannelType,
    pub external_chat_id: String,
    pub sender: String,
    pub text: String,
    pub chat_title: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// A file attachment referenced by an inbound or outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

/// Process-wide typed events published on the [`event_bus::EventBus`].
///
/// The boundary (HTTP/WS dashboard, out of scope here) observes these
/// without the core needing to know anything about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    MessageReceived {
        channel_id: ChannelId,
        conversation_id: ConversationId,
    },
    RunStarted {
        run_id: RunId,
        conversation_id: ConversationId,
    },
    RunCompleted {
        run_id: RunId,
        conversation_id: ConversationId,
        output_tokens: i64,
    },
    RunError {
        run_id: RunId,
        conversation_id: ConversationId,
        message: String,
    },
    ApprovalRequired {
        approval_id: ApprovalId,
        conversation_id: ConversationId,
        tool_name: String,
        risk_level: String,
    },
    ApprovalResolved {
        approval_id: ApprovalId,
        approved: bool,
        reason: Option<String>,
    },
    ToolStarted {
        run_id: RunId,
        tool_name: String,
    },
    ToolCompleted {
        run_id: RunId,
        tool_name: String,
        is_error: bool,
    },
    AdapterStatus {
        channel_id: ChannelId,
        status: ConnectionStatus,
        last_error: Option<String>,
    },
    McpServerStatus {
        server_id: uuid::Uuid,
        status: String,
    },
}

/// Shared, process-wide dependency bundle threaded through the core.
///
/// Things that would otherwise end up as module-level singletons (tool
/// registry, circuit breaker, pending-approval map, DB handle, adapter
/// map, MCP client map) are constructed once at startup and handed
/// around explicitly here instead.
#[derive(Clone)]
pub struct AppContext {
    pub db: db::Db,
    pub config: Arc<config::RuntimeConfig>,
    pub event_bus: event_bus::EventBus,
    pub tool_registry: Arc<tools::ToolRegistry>,
    pub skill_catalog: Arc<tools::catalog::SkillCatalog>,
    pub hitl: Arc<hitl::ApprovalManager>,
    pub container_runner: Arc<container_runner::ContainerRunner>,
    pub mcp_manager: Arc<mcp::McpManager>,
    pub llm: Arc<llm::LlmManager>,
    pub resilience: Arc<resilience::Resilience>,
}

/// Outbound response destined for a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundResponse {
    Text(String),
    File {
        filename: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime_type: String,
        caption: Option<String>,
    },
    ApprovalPrompt {
        approval_id: ApprovalId,
        tool_name: String,
        risk_level: String,
        summary: String,
    },
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

/// Per-run tool-execution outcome handed back into the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
    pub file_outputs: Vec<Attachment>,
}

/// Extra metadata a channel attaches to an inbound message, useful for
/// adapter-specific reply targeting (thread ids, message ids, etc).
pub type ChannelMetadata = HashMap<String, serde_json::Value>;
