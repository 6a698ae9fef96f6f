//! Configuration loading and validation.
//!
//! Everything the core reads directly from the environment is parsed
//! here into typed, `Default`-backed structs grouped by concern.
//! Tunables that can change at runtime (resilience knobs, per-channel
//! enable flags) are wrapped in [`arc_swap::ArcSwap`] so a reload never
//! requires a restart.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::PathBuf;

/// Top-level static configuration, loaded once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub anthropic_api_key: Option<String>,
    pub agent_model: String,
    pub agent_max_tokens: u32,
    pub agent_system_prompt: String,
    pub encryption_key: Option<String>,
    pub edge_mode: bool,
    pub edge_mode_max_concurrent_requests: usize,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .map(|d| d.join("loop-gateway"))
                    .unwrap_or_else(|| PathBuf::from("./data"))
            });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
        for sub in ["skills", "prompts", "loop-output", "files"] {
            std::fs::create_dir_all(data_dir.join(sub))
                .with_context(|| format!("failed to create {sub} directory"))?;
        }

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gateway.db"));

        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        if anthropic_api_key.is_none() {
            return Err(ConfigError::Invalid(
                "No LLM provider API key found. Set ANTHROPIC_API_KEY.".into(),
            )
            .into());
        }

        let agent_system_prompt = match std::env::var("AGENT_SYSTEM_PROMPT_FILE") {
            Ok(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read AGENT_SYSTEM_PROMPT_FILE at {path}"))?,
            Err(_) => default_system_prompt(),
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8080),
            data_dir,
            db_path,
            anthropic_api_key,
            agent_model: std::env::var("AGENT_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            agent_max_tokens: env_parse("AGENT_MAX_TOKENS", 4096),
            agent_system_prompt,
            encryption_key: std::env::var("ENCRYPTION_KEY").ok(),
            edge_mode: env_flag("EDGE_MODE"),
            edge_mode_max_concurrent_requests: env_parse("EDGE_MODE_MAX_CONCURRENT_REQUESTS", 8),
        })
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.db_path.clone()
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills")
    }
}

/// Resilience (retry + circuit breaker) tuning, read from `RETRY_*`/`CB_*`.
#[derive(Debug, Clone, Copy)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_success_threshold: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_success_threshold: 1,
        }
    }
}

impl ResilienceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("RETRY_MAX_RETRIES", defaults.max_retries),
            base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", defaults.base_delay_ms),
            max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", defaults.max_delay_ms),
            jitter_factor: env_parse("RETRY_JITTER_FACTOR", defaults.jitter_factor),
            failure_threshold: env_parse("CB_FAILURE_THRESHOLD", defaults.failure_threshold),
            reset_timeout_ms: env_parse("CB_RESET_TIMEOUT_MS", defaults.reset_timeout_ms),
            half_open_success_threshold: env_parse(
                "CB_HALF_OPEN_SUCCESS_THRESHOLD",
                defaults.half_open_success_threshold,
            ),
        }
    }
}

/// Container-runner tuning, read from `CONTAINER_*`/`MAX_CONCURRENT_CONTAINERS`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    pub memory_limit_bytes: i64,
    pub cpu_limit: f64,
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_concurrent: 3,
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_limit: 1.0,
            image: "loop-gateway-agent-sandbox:latest".to_string(),
        }
    }
}

impl ContainerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_ms: env_parse("CONTAINER_TIMEOUT_MS", defaults.timeout_ms),
            max_concurrent: env_parse("MAX_CONCURRENT_CONTAINERS", defaults.max_concurrent),
            memory_limit_bytes: env_parse("CONTAINER_MEMORY_LIMIT_BYTES", defaults.memory_limit_bytes),
            cpu_limit: env_parse("CONTAINER_CPU_LIMIT", defaults.cpu_limit),
            image: std::env::var("CONTAINER_IMAGE").unwrap_or(defaults.image),
        }
    }
}

/// Default HITL risk-tier rules: low/medium risk tools auto-pass, high/critical
/// risk tools require a human response before the tool call proceeds.
#[derive(Debug, Clone, Copy)]
pub struct HitlDefaults {
    pub high_timeout_secs: u64,
    pub critical_timeout_secs: u64,
}

impl Default for HitlDefaults {
    fn default() -> Self {
        Self {
            high_timeout_secs: 300,
            critical_timeout_secs: 600,
        }
    }
}

/// Bundle of runtime-mutable configuration, hot-swappable without restart.
pub struct RuntimeConfig {
    pub static_config: Config,
    pub resilience: arc_swap::ArcSwap<ResilienceConfig>,
    pub container: arc_swap::ArcSwap<ContainerConfig>,
    pub hitl_defaults: HitlDefaults,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            static_config: Config::load()?,
            resilience: arc_swap::ArcSwap::from_pointee(ResilienceConfig::from_env()),
            container: arc_swap::ArcSwap::from_pointee(ContainerConfig::from_env()),
            hitl_defaults: HitlDefaults::default(),
        })
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant reachable across chat channels. Use the available tools \
     when they help answer the request; ask for human approval is handled automatically \
     for risky tools, so attempt the call and read the result."
        .to_string()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resilience_defaults_are_sane() {
        let defaults = ResilienceConfig::default();
        assert_eq!(defaults.max_retries, 3);
        assert!(defaults.failure_threshold > 0);
    }

    #[test]
    fn env_parse_falls_back_on_missing_or_bad_value() {
        assert_eq!(env_parse::<u32>("LOOP_GATEWAY_DOES_NOT_EXIST", 7), 7);
    }
}
