//! Top-level error types for Loop Gateway.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Hitl(#[from] HitlError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Skill(#[from] SkillError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider and model errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent-run (conversation, branch, history assembly) errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("conversation {id} not found")]
    ConversationNotFound { id: String },

    #[error("branch {id} not found")]
    BranchNotFound { id: String },

    #[error("cannot delete the root branch of a conversation")]
    CannotDeleteRootBranch,

    #[error("run {id} not found")]
    RunNotFound { id: String },

    #[error("hop limit ({limit}) reached without a final text reply")]
    HopLimitReached { limit: usize },

    #[error("run cancelled: {reason}")]
    Cancelled { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Resilience (retry/circuit breaker) errors.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("circuit open for '{label}' since {opened_at}")]
    CircuitOpen {
        label: String,
        opened_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("'{label}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        source: Box<Error>,
    },
}

/// HITL approval-manager errors.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    #[error("approval {id} not found")]
    NotFound { id: String },

    #[error("approval {id} already resolved")]
    AlreadyResolved { id: String },
}

/// Container-runner errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to spawn sandbox: {0}")]
    SpawnFailed(String),

    #[error("sandbox timed out after {0}ms")]
    Timeout(u64),

    #[error("sandbox output missing sentinel markers; stderr tail: {stderr_tail}")]
    MissingSentinels { stderr_tail: String },

    #[error("sandbox output JSON invalid: {0}")]
    InvalidOutput(String),

    #[error("sandbox reported an error: {0}")]
    SandboxError(String),
}

/// MCP integration errors.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server {name} not found")]
    NotFound { name: String },

    #[error("failed to start MCP server container: {0}")]
    ContainerStart(String),

    #[error("failed to connect MCP client for {name}: {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("MCP tool call failed: {0}")]
    ToolCallFailed(String),
}

/// Tool/skill registry errors.
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill manifest at {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("skill '{name}' not found")]
    NotFound { name: String },

    #[error("tool '{name}' is built-in and cannot be overwritten")]
    BuiltinProtected { name: String },
}

/// Channel adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("adapter '{adapter}' is not connected")]
    NotConnected { adapter: String },

    #[error("adapter '{adapter}' send failed: {reason}")]
    SendFailed { adapter: String, reason: String },

    #[error("unsupported capability '{capability}' on adapter '{adapter}'")]
    UnsupportedCapability { adapter: String, capability: String },
}
