//! Adapts an MCP server's tools onto `rig`'s [`Tool`] trait so they sit in
//! the same [`rig::tool::ToolSet`] as built-in and skill-provided tools.

use crate::mcp::McpConnection;
use crate::tools::{truncate_output, MAX_TOOL_OUTPUT_BYTES};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct McpToolAdapter {
    server_name: String,
    tool_name: String,
    description: String,
    input_schema: Value,
    connection: Arc<McpConnection>,
}

impl McpToolAdapter {
    pub fn new(server_name: String, tool: rmcp::model::Tool, connection: Arc<McpConnection>) -> Self {
        let input_schema = tool.schema_as_json_value();
        let description = tool
            .description
            .map(|d| d.into_owned())
            .unwrap_or_default();

        Self {
            server_name,
            tool_name: tool.name.into_owned(),
            description,
            input_schema,
            connection,
        }
    }

    /// `mcp_<sanitized server>_<sanitized tool>` — the flat namespace every
    /// bridged MCP tool lives under, so it can't collide with a built-in
    /// or skill tool of the same underlying name.
    fn namespaced_name(&self) -> String {
        format!(
            "mcp_{}_{}",
            sanitize_tool_identifier(&self.server_name),
            sanitize_tool_identifier(&self.tool_name)
        )
    }

    fn collect_result_text(result: &rmcp::model::CallToolResult) -> String {
        let mut blocks = result
            .content
            .iter()
            .map(|content| match &content.raw {
                rmcp::model::RawContent::Text(text) => text.text.clone(),
                rmcp::model::RawContent::Resource(resource) => match &resource.resource {
                    rmcp::model::ResourceContents::TextResourceContents { text, .. } => text.clone(),
                    _ => serde_json::to_string(&content.raw)
                        .unwrap_or_else(|_| "[unsupported resource content]".to_string()),
                },
                other => serde_json::to_string(other)
                    .unwrap_or_else(|_| "[unsupported mcp content]".to_string()),
            })
            .collect::<Vec<_>>();

        if let Some(structured) = &result.structured_content {
            blocks.push(structured.to_string());
        }

        blocks.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("MCP tool call failed: {0}")]
pub struct McpToolError(String);

#[derive(Debug, Serialize)]
pub struct McpToolOutput {
    pub result: String,
}

impl Tool for McpToolAdapter {
    const NAME: &'static str = "mcp_tool";

    type Error = McpToolError;
    type Args = Value;
    type Output = McpToolOutput;

    fn name(&self) -> String {
        self.namespaced_name()
    }

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: self.namespaced_name(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let result = self
            .connection
            .call_tool(&self.tool_name, args)
            .await
            .map_err(|e| McpToolError(e.to_string()))?;

        let output_text = truncate_output(&Self::collect_result_text(&result), MAX_TOOL_OUTPUT_BYTES);

        if result.is_error.unwrap_or(false) {
            let message = if output_text.is_empty() {
                format!(
                    "MCP server '{}' reported an error while calling '{}'",
                    self.server_name, self.tool_name
                )
            } else {
                output_text
            };
            return Err(McpToolError(message));
        }

        Ok(McpToolOutput {
            result: if output_text.is_empty() {
                "[tool returned no content]".to_string()
            } else {
                output_text
            },
        })
    }
}

/// Lowercase alphanumerics with runs of other characters collapsed to a
/// single underscore, leading digit guarded. Keeps generated tool names
/// valid identifiers for providers that validate tool-name syntax.
fn sanitize_tool_identifier(raw: &str) -> String {
    let mut value: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();

    while value.contains("__") {
        value = value.replace("__", "_");
    }
    value = value.trim_matches('_').to_string();
    if value.is_empty() {
        value = "tool".to_string();
    }
    if value.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        value.insert(0, '_');
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_mixed_case_and_punctuation() {
        assert_eq!(sanitize_tool_identifier("My Server!!"), "my_server");
        assert_eq!(sanitize_tool_identifier("123abc"), "_123abc");
        assert_eq!(sanitize_tool_identifier("___"), "tool");
    }
}
