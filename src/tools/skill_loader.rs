//! Discovers skill packages on disk and exposes each as a tool backed by
//! a handler subprocess.
//!
//! A skill is a directory containing `skill.json` (name, description,
//! JSON Schema input, risk level, handler command) plus whatever files
//! the handler needs. The handler is invoked once per tool call —
//! stdin gets the JSON arguments, stdout is expected to be a single
//! JSON value — the same piped-stdio, captured-stderr shape the
//! subprocess lifecycle elsewhere in the gateway uses, just without a
//! long-lived process to manage.

use crate::db::models::RiskLevel;
use crate::error::Result;
use crate::tools::truncate_output;
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub risk_level: Option<String>,
    pub handler: HandlerSpec,
    /// Run the handler inside a throwaway container instead of a bare host
    /// subprocess. Needs Docker and a `container_runner::ContainerRunner`
    /// bound via [`SkillTool::new`]; skills that don't set this keep
    /// running as a plain child process.
    #[serde(default)]
    pub sandbox: bool,
    /// Image to run the handler under when `sandbox` is set. Falls back to
    /// the gateway's default sandbox image if absent.
    #[serde(default)]
    pub container_image: Option<String>,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Scan `skills_dir` for immediate subdirectories containing a valid
/// `skill.json`. Invalid manifests are skipped with a logged warning
/// rather than aborting the whole scan.
pub fn discover(skills_dir: &Path) -> Result<Vec<(SkillManifest, PathBuf)>> {
    let mut found = Vec::new();
    if !skills_dir.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(skills_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let manifest_path = entry.path().join("skill.json");
        if !manifest_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&manifest_path)?;
        match serde_json::from_str::<SkillManifest>(&text) {
            Ok(manifest) => found.push((manifest, entry.path())),
            Err(e) => {
                tracing::warn!(path = %manifest_path.display(), error = %e, "skipping invalid skill manifest");
            }
        }
    }
    Ok(found)
}

pub fn risk_level_of(manifest: &SkillManifest) -> RiskLevel {
    match manifest.risk_level.as_deref() {
        Some("low") => RiskLevel::Low,
        Some("medium") => RiskLevel::Medium,
        Some("high") => RiskLevel::High,
        Some("critical") => RiskLevel::Critical,
        _ => RiskLevel::Medium,
    }
}

/// A skill exposed as a `rig::tool::Tool`, invoking its handler as a
/// short-lived subprocess per call.
#[derive(Clone)]
pub struct SkillTool {
    manifest: SkillManifest,
    directory: PathBuf,
    container_runner: Option<std::sync::Arc<crate::container_runner::ContainerRunner>>,
    default_sandbox_image: String,
}

impl SkillTool {
    pub fn new(manifest: SkillManifest, directory: PathBuf) -> Self {
        Self {
            manifest,
            directory,
            container_runner: None,
            default_sandbox_image: String::new(),
        }
    }

    /// Enable sandboxed execution for manifests with `sandbox: true`.
    /// `default_sandbox_image` backs skills that don't set their own
    /// `container_image`.
    pub fn with_container_runner(
        mut self,
        runner: std::sync::Arc<crate::container_runner::ContainerRunner>,
        default_sandbox_image: String,
    ) -> Self {
        self.container_runner = Some(runner);
        self.default_sandbox_image = default_sandbox_image;
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("skill '{0}' failed: {1}")]
pub struct SkillToolError(String, String);

#[derive(Debug, Serialize)]
pub struct SkillToolOutput {
    pub result: String,
}

impl Tool for SkillTool {
    const NAME: &'static str = "skill_tool";

    type Error = SkillToolError;
    type Args = serde_json::Value;
    type Output = SkillToolOutput;

    fn name(&self) -> String {
        self.manifest.name.clone()
    }

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: self.manifest.name.clone(),
            description: self.manifest.description.clone(),
            parameters: self.manifest.input_schema.clone(),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        if self.manifest.sandbox {
            return self.call_sandboxed(args).await;
        }

        let mut cmd = Command::new(&self.manifest.handler.command);
        cmd.args(&self.manifest.handler.args)
            .current_dir(&self.directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SkillToolError(self.manifest.name.clone(), format!("failed to spawn handler: {e}"))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&args).unwrap_or_default();
            let _ = stdin.write_all(&payload).await;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            SkillToolError(self.manifest.name.clone(), format!("handler exited abnormally: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SkillToolError(
                self.manifest.name.clone(),
                truncate_output(&stderr, crate::tools::MAX_TOOL_OUTPUT_BYTES),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(SkillToolOutput {
            result: truncate_output(&stdout, crate::tools::MAX_TOOL_OUTPUT_BYTES),
        })
    }
}

impl SkillTool {
    async fn call_sandboxed(&self, args: serde_json::Value) -> Result<SkillToolOutput, SkillToolError> {
        let runner = self.container_runner.as_ref().ok_or_else(|| {
            SkillToolError(self.manifest.name.clone(), "skill requires a sandbox but none is configured".into())
        })?;

        let image = self
            .manifest
            .container_image
            .clone()
            .unwrap_or_else(|| self.default_sandbox_image.clone());
        let request = crate::container_runner::ContainerRequest {
            image,
            input: serde_json::json!({
                "command": self.manifest.handler.command,
                "args": self.manifest.handler.args,
                "input": args,
            }),
            env: std::collections::HashMap::new(),
        };

        let output = runner
            .run(request)
            .await
            .map_err(|e| SkillToolError(self.manifest.name.clone(), e.to_string()))?;

        if let Some(error) = output.get("error").and_then(|v| v.as_str()) {
            return Err(SkillToolError(self.manifest.name.clone(), error.to_string()));
        }
        let result = output
            .get("content")
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default();
        Ok(SkillToolOutput {
            result: truncate_output(&result, crate::tools::MAX_TOOL_OUTPUT_BYTES),
        })
    }
}
