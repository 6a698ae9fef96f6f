//! Discovery catalog: skills that exist but aren't in the active tool
//! set get summarized into the system prompt instead, and a built-in
//! `suggest_skill` tool lets the agent ask to activate one mid-run.
//!
//! Activating a catalog entry is itself HITL-gated at medium risk by
//! default — a skill's handler is arbitrary code, so letting an agent
//! silently pull a new capability into scope isn't a low-risk operation
//! even though merely *listing* the catalog is.

use crate::db::models::RiskLevel;
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
}

pub struct SkillCatalog {
    entries: RwLock<Vec<CatalogEntry>>,
}

impl SkillCatalog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn set(&self, entries: Vec<CatalogEntry>) {
        *self.entries.write().unwrap() = entries;
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.entries.read().unwrap().clone()
    }

    /// A short addendum appended to the system prompt listing inactive
    /// skills by name and one-line description.
    pub fn prompt_addendum(&self) -> String {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("\nAdditional skills available but not currently active:\n");
        for entry in entries.iter() {
            out.push_str(&format!("- {}: {}\n", entry.name, entry.description));
        }
        out.push_str("Call suggest_skill with the skill name to activate one for this conversation.\n");
        out
    }
}

impl Default for SkillCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct SuggestSkillArgs {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestSkillOutput {
    pub activated: bool,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("suggest_skill failed: {0}")]
pub struct SuggestSkillError(String);

/// Built-in tool that requests activation of a catalog skill. Actual
/// activation (moving the skill from catalog-only to an enabled tool in
/// the registry) happens in the agent loop after HITL approves it; this
/// tool only records the request and reports back what the loop decided.
#[derive(Clone)]
pub struct SuggestSkillTool {
    catalog: std::sync::Arc<SkillCatalog>,
}

impl SuggestSkillTool {
    pub fn new(catalog: std::sync::Arc<SkillCatalog>) -> Self {
        Self { catalog }
    }
}

impl Tool for SuggestSkillTool {
    const NAME: &'static str = "suggest_skill";

    type Error = SuggestSkillError;
    type Args = SuggestSkillArgs;
    type Output = SuggestSkillOutput;

    fn name(&self) -> String {
        "suggest_skill".to_string()
    }

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: "suggest_skill".to_string(),
            description: "Request activation of an inactive skill by name so it becomes callable in this conversation.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let known = self
            .catalog
            .entries()
            .into_iter()
            .any(|e| e.name == args.name);
        if !known {
            return Err(SuggestSkillError(format!("no catalog entry named '{}'", args.name)));
        }
        // The agent loop intercepts this tool name before dispatch and
        // runs the HITL-gated activation; reaching here means it was
        // called directly, which shouldn't normally happen.
        Ok(SuggestSkillOutput {
            activated: false,
            message: "activation is handled by the agent loop, not this tool directly".to_string(),
        })
    }
}

pub const SUGGEST_SKILL_RISK: RiskLevel = RiskLevel::Medium;
