//! Row types shared across the repository modules.

use crate::{ApprovalId, BranchId, ChannelId, ChannelType, ConnectionStatus, ConversationId, RunId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: ChannelId,
    pub channel_type: ChannelType,
    pub display_name: String,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub channel_id: ChannelId,
    pub external_chat_id: String,
    pub title: Option<String>,
    pub active_branch_id: Option<BranchId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRow {
    pub id: BranchId,
    pub conversation_id: ConversationId,
    pub parent_branch_id: Option<BranchId>,
    pub branch_point_message_id: Option<i64>,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            "system" => MessageRole::System,
            other => {
                return Err(crate::error::DbError::Invariant(format!(
                    "unknown message role '{other}'"
                ))
                .into())
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub branch_id: BranchId,
    pub role: MessageRole,
    pub content: String,
    pub inbound_channel_type: Option<ChannelType>,
    pub external_sender: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "waiting_approval" => RunStatus::WaitingApproval,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            other => {
                return Err(crate::error::DbError::Invariant(format!(
                    "unknown run status '{other}'"
                ))
                .into())
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRow {
    pub id: RunId,
    pub conversation_id: ConversationId,
    pub input_message_id: i64,
    pub status: RunStatus,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub error_text: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Whether a tool call of this risk tier proceeds without a human
    /// response. Matches the low/medium auto-pass, high/critical gated
    /// split recorded in the grounding ledger.
    pub fn auto_approves(&self) -> bool {
        matches!(self, RiskLevel::Low | RiskLevel::Medium)
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "low" => RiskLevel::Low,
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            other => {
                return Err(
                    crate::error::DbError::Invariant(format!("unknown risk level '{other}'")).into(),
                )
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            "timed_out" => ApprovalStatus::TimedOut,
            other => {
                return Err(crate::error::DbError::Invariant(format!(
                    "unknown approval status '{other}'"
                ))
                .into())
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub channel_type: ChannelType,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub risk_level: RiskLevel,
    pub status: ApprovalStatus,
    pub reason: Option<String>,
    pub responder_id: Option<String>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub responded_at: Option<chrono::DateTime<chrono::Utc>>,
    pub timeout_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRegistryRow {
    pub name: String,
    pub enabled: bool,
    pub origin: String,
    pub directory: Option<String>,
    pub manifest_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    Sse,
}

impl McpTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransport::Stdio => "stdio",
            McpTransport::Sse => "sse",
        }
    }
}

impl std::str::FromStr for McpTransport {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stdio" => McpTransport::Stdio,
            "sse" => McpTransport::Sse,
            other => {
                return Err(crate::error::DbError::Invariant(format!(
                    "unknown MCP transport '{other}'"
                ))
                .into())
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRow {
    pub id: uuid::Uuid,
    pub name: String,
    pub image: String,
    pub transport: McpTransport,
    pub port: Option<i64>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env_encrypted: String,
    pub volumes: Vec<String>,
    pub status: String,
    pub container_id: Option<String>,
    pub host_port: Option<i64>,
    pub cached_tools: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallRow {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub isolated: bool,
    pub group_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
