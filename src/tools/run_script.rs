//! Built-in `run_script` tool: runs a shell command directly on the
//! gateway host. High risk by default — HITL gates every call unless a
//! deployment's approval rules explicitly lower the bar for it.

use crate::tools::shell::shell;
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RunScriptArgs {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct RunScriptOutput {
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, thiserror::Error)]
#[error("run_script failed: {0}")]
pub struct RunScriptError(String);

#[derive(Clone, Default)]
pub struct RunScriptTool;

impl Tool for RunScriptTool {
    const NAME: &'static str = "run_script";

    type Error = RunScriptError;
    type Args = RunScriptArgs;
    type Output = RunScriptOutput;

    fn name(&self) -> String {
        "run_script".to_string()
    }

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: "run_script".to_string(),
            description: "Run a shell command on the gateway host and return its output. Subject to human approval before it executes.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let result = shell(&args.command, None)
            .await
            .map_err(|e| RunScriptError(e.to_string()))?;
        Ok(RunScriptOutput {
            success: result.success,
            exit_code: result.exit_code,
            output: result.format(),
        })
    }
}
