//! LLM manager: holds the Anthropic API key and a shared HTTP client.
//!
//! The gateway rides `rig-core`'s [`rig::completion::CompletionModel`]
//! trait rather than defining its own provider API; this manager is just
//! the client-credentials bundle `GatewayModel::make` needs — no
//! multi-provider routing or OAuth refresh, just a static
//! `ANTHROPIC_API_KEY`.

use anyhow::Context as _;

/// Shared Anthropic credentials and HTTP client.
pub struct LlmManager {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl LlmManager {
    pub fn new(api_key: String) -> crate::error::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
