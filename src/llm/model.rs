//! `GatewayModel`: a `rig::completion::CompletionModel` that calls the
//! Anthropic Messages API directly over `reqwest`.
//!
//! Builds and parses raw Anthropic Messages API requests directly,
//! without multi-provider dispatch, fallback-chain routing, or a
//! per-call retry loop — retries and circuit breaking are the caller's
//! job, done once at the agent-loop boundary via
//! [`crate::resilience::Resilience`], not duplicated here.

use crate::llm::manager::LlmManager;

use rig::completion::{self, CompletionError, CompletionModel, CompletionRequest, GetTokenUsage};
use rig::message::{AssistantContent, DocumentSourceKind, Image, Message, MimeType, Text, ToolCall, ToolFunction, UserContent};
use rig::one_or_many::OneOrMany;
use rig::streaming::StreamingCompletionResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw Anthropic response body, carried through so the caller can read
/// token usage or other fields `rig`'s typed response doesn't surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStreamingResponse {
    pub body: serde_json::Value,
}

impl GetTokenUsage for RawStreamingResponse {
    fn token_usage(&self) -> Option<completion::Usage> {
        None
    }
}

/// Completion model bound to one Anthropic model name (e.g.
/// `claude-sonnet-4-20250514`).
#[derive(Clone)]
pub struct GatewayModel {
    llm_manager: Arc<LlmManager>,
    model_name: String,
}

impl GatewayModel {
    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl CompletionModel for GatewayModel {
    type Response = RawResponse;
    type StreamingResponse = RawStreamingResponse;
    type Client = Arc<LlmManager>;

    fn make(client: &Self::Client, model: impl Into<String>) -> Self {
        Self {
            llm_manager: client.clone(),
            model_name: model.into(),
        }
    }

    async fn completion(
        &self,
        request: CompletionRequest,
    ) -> Result<completion::CompletionResponse<RawResponse>, CompletionError> {
        let messages_url = format!("{}/v1/messages", self.llm_manager.base_url());
        let messages = convert_messages_to_anthropic(&request.chat_history);

        let mut body = serde_json::json!({
            "model": self.model_name,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
        });

        if let Some(preamble) = &request.preamble {
            body["system"] = serde_json::json!(preamble);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        let response = self
            .llm_manager
            .http_client()
            .post(&messages_url)
            .header("x-api-key", self.llm_manager.api_key())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::ProviderError(e.to_string()))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| CompletionError::ProviderError(format!("failed to read response body: {e}")))?;

        let response_body: serde_json::Value = serde_json::from_str(&response_text).map_err(|e| {
            CompletionError::ProviderError(format!(
                "Anthropic response ({status}) is not valid JSON: {e}\nBody: {}",
                truncate_body(&response_text)
            ))
        })?;

        if !status.is_success() {
            let message = response_body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(CompletionError::ProviderError(format!(
                "Anthropic API error ({status}): {message}"
            )));
        }

        parse_anthropic_response(response_body)
    }

    async fn stream(
        &self,
        _request: CompletionRequest,
    ) -> Result<StreamingCompletionResponse<RawStreamingResponse>, CompletionError> {
        Err(CompletionError::ProviderError("streaming not implemented".into()))
    }
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    if body.len() <= limit { body } else { &body[..limit] }
}

fn make_tool_call(id: String, name: String, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id,
        call_id: None,
        function: ToolFunction { name: name.trim().to_string(), arguments },
        signature: None,
        additional_params: None,
    }
}

fn tool_result_content_to_string(content: &OneOrMany<rig::message::ToolResultContent>) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            rig::message::ToolResultContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn convert_image_anthropic(image: &Image) -> Option<serde_json::Value> {
    let media_type = image.media_type.as_ref().map(|mt| mt.to_mime_type()).unwrap_or("image/jpeg");
    match &image.data {
        DocumentSourceKind::Base64(data) => Some(serde_json::json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        })),
        DocumentSourceKind::Url(url) => Some(serde_json::json!({
            "type": "image",
            "source": {"type": "url", "url": url},
        })),
        _ => None,
    }
}

pub(crate) fn convert_messages_to_anthropic(messages: &OneOrMany<Message>) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|message| match message {
            Message::User { content } => {
                let parts: Vec<serde_json::Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        UserContent::Text(t) => Some(serde_json::json!({"type": "text", "text": t.text})),
                        UserContent::Image(image) => convert_image_anthropic(image),
                        UserContent::ToolResult(result) => Some(serde_json::json!({
                            "type": "tool_result",
                            "tool_use_id": result.id,
                            "content": tool_result_content_to_string(&result.content),
                        })),
                        _ => None,
                    })
                    .collect();
                serde_json::json!({"role": "user", "content": parts})
            }
            Message::Assistant { content, .. } => {
                let parts: Vec<serde_json::Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        AssistantContent::Text(t) => Some(serde_json::json!({"type": "text", "text": t.text})),
                        AssistantContent::ToolCall(tc) => Some(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.function.name,
                            "input": tc.function.arguments,
                        })),
                        _ => None,
                    })
                    .collect();
                serde_json::json!({"role": "assistant", "content": parts})
            }
        })
        .collect()
}

fn parse_anthropic_response(
    body: serde_json::Value,
) -> Result<completion::CompletionResponse<RawResponse>, CompletionError> {
    let content_blocks = body["content"]
        .as_array()
        .ok_or_else(|| CompletionError::ResponseError("missing content array".into()))?;

    let mut assistant_content = Vec::new();
    for block in content_blocks {
        match block["type"].as_str() {
            Some("text") => {
                let text = block["text"].as_str().unwrap_or("").to_string();
                assistant_content.push(AssistantContent::Text(Text { text }));
            }
            Some("tool_use") => {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                let arguments = block["input"].clone();
                assistant_content.push(AssistantContent::ToolCall(make_tool_call(id, name, arguments)));
            }
            _ => {}
        }
    }

    let choice = OneOrMany::many(assistant_content)
        .map_err(|_| CompletionError::ResponseError("empty response from Anthropic".into()))?;

    let input_tokens = body["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = body["usage"]["output_tokens"].as_u64().unwrap_or(0);
    let cached = body["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0);

    Ok(completion::CompletionResponse {
        choice,
        usage: completion::Usage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cached_input_tokens: cached,
        },
        raw_response: RawResponse { body },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "tu_1", "name": "shell", "input": {"command": "ls"}},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let response = parse_anthropic_response(body).unwrap();
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[test]
    fn empty_content_array_is_an_error() {
        let body = serde_json::json!({"content": [], "usage": {}});
        assert!(parse_anthropic_response(body).is_err());
    }
}
