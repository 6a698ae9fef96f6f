//! Tool and skill registry sitting above `rig`'s [`ToolSet`].
//!
//! `ToolSet` alone is a flat, append-only bag; the registry adds the
//! bookkeeping the gateway actually needs: enable/disable per tool
//! (without unregistering it), protection for built-in tool names so a
//! same-named user skill can't silently shadow them, and the per-tool
//! risk level HITL consults before a call is allowed to run.

pub mod catalog;
pub mod mcp_bridge;
pub mod run_script;
pub mod shell;
pub mod skill_loader;

use crate::db::models::RiskLevel;
use crate::error::{Result, SkillError};
use rig::tool::{Tool as RigTool, ToolSet};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Maximum bytes of tool output kept before truncation, so a runaway tool
/// result can't blow up the context window or a channel's message-size
/// limit.
pub const MAX_TOOL_OUTPUT_BYTES: usize = 16 * 1024;

pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[...truncated, {} bytes total]", &text[..cut], text.len())
}

#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub risk_level: RiskLevel,
    pub builtin: bool,
    pub enabled: bool,
}

/// Tool/skill registry. `tool_set` holds the actual `rig::tool::Tool`
/// implementations (used to build the agent's completion request);
/// `metadata` tracks enable state, risk tier, and built-in protection.
pub struct ToolRegistry {
    tool_set: RwLock<ToolSet>,
    metadata: RwLock<HashMap<String, ToolMetadata>>,
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tool_set: RwLock::new(ToolSet::default()),
            metadata: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Register a built-in tool. Built-ins can never be overwritten by a
    /// later `register_skill` call with the same name.
    pub fn register_builtin(&self, tool: impl RigTool + 'static, risk_level: RiskLevel) {
        let name = tool.name();
        self.builtin_names.write().unwrap().insert(name.clone());
        self.metadata.write().unwrap().insert(
            name.clone(),
            ToolMetadata {
                name: name.clone(),
                risk_level,
                builtin: true,
                enabled: true,
            },
        );
        self.tool_set.write().unwrap().add_tool(tool);
    }

    /// Register a tool that isn't built in (a skill handler bridge, or an
    /// MCP bridge tool). Fails if a built-in already owns this name.
    pub fn register_dynamic(
        &self,
        tool: impl RigTool + 'static,
        risk_level: RiskLevel,
    ) -> Result<()> {
        let name = tool.name();
        if self.builtin_names.read().unwrap().contains(&name) {
            return Err(SkillError::BuiltinProtected { name }.into());
        }
        self.metadata.write().unwrap().insert(
            name.clone(),
            ToolMetadata {
                name: name.clone(),
                risk_level,
                builtin: false,
                enabled: true,
            },
        );
        self.tool_set.write().unwrap().add_tool(tool);
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut metadata = self.metadata.write().unwrap();
        let entry = metadata.get_mut(name).ok_or_else(|| SkillError::NotFound {
            name: name.to_string(),
        })?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn risk_level(&self, name: &str) -> Option<RiskLevel> {
        self.metadata.read().unwrap().get(name).map(|m| m.risk_level)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.metadata
            .read()
            .unwrap()
            .get(name)
            .map(|m| m.enabled)
            .unwrap_or(false)
    }

    /// Tool schemas for every currently-enabled tool, handed to the LLM
    /// client as the completion request's tool list.
    pub async fn enabled_definitions(&self, prompt: &str) -> Vec<rig::completion::ToolDefinition> {
        let enabled_names: HashSet<String> = self
            .metadata
            .read()
            .unwrap()
            .values()
            .filter(|m| m.enabled)
            .map(|m| m.name.clone())
            .collect();

        let names: Vec<String> = self.tool_set.read().unwrap().names();
        let mut defs = Vec::with_capacity(names.len());
        for name in names {
            if !enabled_names.contains(&name) {
                continue;
            }
            if let Some(def) = self
                .tool_set
                .read()
                .unwrap()
                .get(&name)
                .map(|tool| tool.definition(prompt.to_string()))
            {
                defs.push(def.await);
            }
        }
        defs
    }

    pub fn list_metadata(&self) -> Vec<ToolMetadata> {
        self.metadata.read().unwrap().values().cloned().collect()
    }

    pub fn tool_set(&self) -> std::sync::RwLockReadGuard<'_, ToolSet> {
        self.tool_set.read().unwrap()
    }

    /// Dispatch a named tool call with JSON-string arguments, the same
    /// dynamic-dispatch convention `ToolSet` backs `rig`'s own multi-turn
    /// tool loop with. The agent loop calls this directly (rather than
    /// letting `rig` auto-dispatch) so HITL approval can sit in between
    /// "model emitted a tool call" and "tool actually runs".
    pub async fn call(&self, name: &str, args: String) -> Result<String> {
        let tool_set = self.tool_set.read().unwrap();
        tool_set
            .call(name, args)
            .await
            .map_err(|e| SkillError::NotFound { name: format!("{name}: {e}") }.into())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_output_at_a_char_boundary() {
        let text = "a".repeat(100);
        let truncated = truncate_output(&text, 10);
        assert!(truncated.starts_with(&"a".repeat(10)));
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn leaves_short_output_untouched() {
        assert_eq!(truncate_output("hi", 10), "hi");
    }
}
