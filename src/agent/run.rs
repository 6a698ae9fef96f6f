//! The Agent Loop: drives the completion model hop-by-hop for one turn.
//!
//! Unlike `rig`'s own `Agent::prompt`, which runs its tool-calling loop
//! as a single opaque `await`, this loop inspects every hop's response
//! itself. That's the only way to put human approval strictly between
//! "the model asked to call a tool" and "the tool actually runs": a risky
//! tool call blocks on [`crate::hitl::ApprovalManager::request_approval`]
//! before [`crate::tools::ToolRegistry::call`] ever sees it.

use crate::db::models::{MessageRole, MessageRow, RiskLevel, RunStatus};
use crate::error::{AgentError, LlmError, Result};
use crate::llm::GatewayModel;
use crate::resilience::{is_retriable_error, ResilienceOutcome};
use crate::tools::catalog::SUGGEST_SKILL_RISK;
use crate::{AppContext, BranchId, ChannelType, GatewayEvent, IncomingMessage, RunId};

use rig::completion::{CompletionModel, CompletionRequest};
use rig::message::{AssistantContent, Message, ToolResult, ToolResultContent, UserContent};
use rig::one_or_many::OneOrMany;

/// Hops (model calls) allowed per turn before giving up. A hop is one
/// completion call; a tool-call response that needs another completion
/// to react to the tool's result counts as a second hop.
const MAX_HOPS: usize = 8;

/// What a completed turn produced, for the caller (a channel adapter or
/// the HTTP webhook handler) to relay back out.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Replied {
        run_id: RunId,
        conversation_id: crate::ConversationId,
        text: String,
    },
    Failed {
        run_id: RunId,
        conversation_id: crate::ConversationId,
        message: String,
    },
}

pub struct AgentLoop {
    ctx: AppContext,
}

impl AgentLoop {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run one full turn: persist the inbound message, drive the hop
    /// loop to a final text reply (or a hop-limit/cancellation failure),
    /// and record the outcome.
    pub async fn run_turn(&self, incoming: &IncomingMessage) -> Result<TurnOutcome> {
        let conversation = self
            .ctx
            .db
            .conversations()
            .get_or_create(incoming.channel_id, &incoming.external_chat_id)
            .await?;

        let branch_id = conversation
            .active_branch_id
            .ok_or_else(|| AgentError::ConversationNotFound {
                id: conversation.id.to_string(),
            })?;

        let user_message = self
            .ctx
            .db
            .conversations()
            .append_message(
                conversation.id,
                branch_id,
                MessageRole::User,
                &incoming.text,
                Some(incoming.channel_type),
                Some(&incoming.sender),
            )
            .await?;

        self.ctx.event_bus.publish(GatewayEvent::MessageReceived {
            channel_id: incoming.channel_id,
            conversation_id: conversation.id,
        });

        let run = self.ctx.db.runs().start(conversation.id, user_message.id).await?;
        self.ctx.event_bus.publish(GatewayEvent::RunStarted {
            run_id: run.id,
            conversation_id: conversation.id,
        });

        match self.drive(branch_id, run.id, conversation.id, incoming.channel_type).await {
            Ok(turn) => {
                self.ctx
                    .db
                    .conversations()
                    .append_message(
                        conversation.id,
                        branch_id,
                        MessageRole::Assistant,
                        &turn.text,
                        None,
                        None,
                    )
                    .await?;
                self.ctx
                    .db
                    .runs()
                    .finish(run.id, RunStatus::Completed, turn.input_tokens, turn.output_tokens, None)
                    .await?;
                self.ctx.event_bus.publish(GatewayEvent::RunCompleted {
                    run_id: run.id,
                    conversation_id: conversation.id,
                    output_tokens: turn.output_tokens,
                });
                Ok(TurnOutcome::Replied {
                    run_id: run.id,
                    conversation_id: conversation.id,
                    text: turn.text,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.ctx
                    .db
                    .runs()
                    .finish(run.id, RunStatus::Failed, 0, 0, Some(&message))
                    .await?;
                self.ctx.event_bus.publish(GatewayEvent::RunError {
                    run_id: run.id,
                    conversation_id: conversation.id,
                    message: message.clone(),
                });
                Ok(TurnOutcome::Failed {
                    run_id: run.id,
                    conversation_id: conversation.id,
                    message,
                })
            }
        }
    }

    async fn drive(
        &self,
        branch_id: BranchId,
        run_id: RunId,
        conversation_id: crate::ConversationId,
        channel_type: ChannelType,
    ) -> Result<DriveResult> {
        let history_rows = self.ctx.db.conversations().assemble_branch_history(branch_id).await?;
        let mut messages: Vec<Message> = history_rows.iter().filter_map(row_to_message).collect();
        if messages.is_empty() {
            return Err(AgentError::Other(anyhow::anyhow!("empty history for branch {branch_id}")).into());
        }

        let config = &self.ctx.config.static_config;
        let preamble = format!(
            "{}{}{}",
            config.agent_system_prompt,
            crate::agent::style::hint(channel_type),
            self.ctx.skill_catalog.prompt_addendum()
        );

        if config.edge_mode {
            return self.drive_in_container(&preamble, &messages).await;
        }

        let model = GatewayModel::make(&self.ctx.llm, config.agent_model.clone());

        let mut total_input: i64 = 0;
        let mut total_output: i64 = 0;

        for hop in 0..MAX_HOPS {
            let tool_defs = self.ctx.tool_registry.enabled_definitions(&preamble).await;

            let request = CompletionRequest {
                preamble: Some(preamble.clone()),
                chat_history: OneOrMany::many(messages.clone())
                    .map_err(|_| AgentError::Other(anyhow::anyhow!("empty chat history")))?,
                documents: Vec::new(),
                tools: tool_defs,
                temperature: None,
                max_tokens: Some(config.agent_max_tokens as u64),
                additional_params: None,
            };

            let label = format!("llm:{}", model.model_name());
            let model_for_call = model.clone();
            let response = self
                .ctx
                .resilience
                .execute(&label, move || {
                    let model = model_for_call.clone();
                    let request = request.clone();
                    async move {
                        model.completion(request).await.map_err(|e| {
                            let msg = e.to_string();
                            let err: crate::error::Error = LlmError::CompletionFailed(msg.clone()).into();
                            if is_retriable_error(&msg) {
                                ResilienceOutcome::retriable(err)
                            } else {
                                ResilienceOutcome::fatal(err)
                            }
                        })
                    }
                })
                .await?;

            total_input += response.usage.input_tokens as i64;
            total_output += response.usage.output_tokens as i64;

            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for item in response.choice.iter() {
                match item {
                    AssistantContent::Text(t) => text_parts.push(t.text.clone()),
                    AssistantContent::ToolCall(tc) => tool_calls.push(tc.clone()),
                    _ => {}
                }
            }

            if tool_calls.is_empty() {
                let text = text_parts.join("\n");
                return Ok(DriveResult {
                    text,
                    input_tokens: total_input,
                    output_tokens: total_output,
                });
            }

            messages.push(Message::Assistant {
                id: None,
                content: response.choice.clone(),
            });

            let mut tool_result_contents = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                let outcome = self
                    .dispatch_tool_call(run_id, conversation_id, channel_type, &call.function.name, &call.function.arguments)
                    .await;
                let text = match outcome {
                    Ok(output) => output,
                    Err(e) => format!("error: {e}"),
                };
                tool_result_contents.push(UserContent::ToolResult(ToolResult {
                    id: call.id.clone(),
                    call_id: None,
                    content: OneOrMany::one(ToolResultContent::text(text)),
                }));
            }

            let contents = OneOrMany::many(tool_result_contents)
                .map_err(|_| AgentError::Other(anyhow::anyhow!("no tool results produced")))?;
            messages.push(Message::User { content: contents });

            if hop + 1 == MAX_HOPS {
                return Err(AgentError::HopLimitReached { limit: MAX_HOPS }.into());
            }
        }

        Err(AgentError::HopLimitReached { limit: MAX_HOPS }.into())
    }

    /// Gate a single tool call on HITL approval (if its risk tier
    /// requires one) and dispatch it. `suggest_skill` is intercepted
    /// here rather than handed to the registry: activating a catalog
    /// entry means flipping its enabled flag, which the registry alone
    /// can do.
    async fn dispatch_tool_call(
        &self,
        run_id: RunId,
        conversation_id: crate::ConversationId,
        channel_type: ChannelType,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<String> {
        if tool_name == "suggest_skill" {
            return self
                .dispatch_suggest_skill(run_id, conversation_id, channel_type, arguments)
                .await;
        }

        let risk_level = self
            .ctx
            .tool_registry
            .risk_level(tool_name)
            .unwrap_or(RiskLevel::High);

        if self.ctx.hitl.requires_approval(risk_level) {
            let decision = self
                .ctx
                .hitl
                .request_approval(run_id, conversation_id, channel_type, tool_name, arguments, risk_level)
                .await?;
            if !decision.approved {
                return Ok(format!(
                    "tool call '{tool_name}' was not approved{}",
                    decision.reason.map(|r| format!(": {r}")).unwrap_or_default()
                ));
            }
        }

        self.ctx.event_bus.publish(GatewayEvent::ToolStarted {
            run_id,
            tool_name: tool_name.to_string(),
        });

        let args_json = serde_json::to_string(arguments)
            .map_err(|e| AgentError::Other(anyhow::anyhow!("failed to serialize tool arguments: {e}")))?;
        let result = self.ctx.tool_registry.call(tool_name, args_json).await;

        self.ctx.event_bus.publish(GatewayEvent::ToolCompleted {
            run_id,
            tool_name: tool_name.to_string(),
            is_error: result.is_err(),
        });
        #[cfg(feature = "metrics")]
        crate::metrics::Metrics::global()
            .tool_calls_total
            .with_label_values(&[tool_name, if result.is_err() { "error" } else { "ok" }])
            .inc();

        let output = result?;
        Ok(crate::tools::truncate_output(&output, crate::tools::MAX_TOOL_OUTPUT_BYTES))
    }

    async fn dispatch_suggest_skill(
        &self,
        run_id: RunId,
        conversation_id: crate::ConversationId,
        channel_type: ChannelType,
        arguments: &serde_json::Value,
    ) -> Result<String> {
        let name = arguments["name"]
            .as_str()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("suggest_skill requires a 'name' argument")))?;

        if !self.ctx.skill_catalog.entries().into_iter().any(|e| e.name == name) {
            return Ok(format!("no catalog entry named '{name}'"));
        }

        let decision = self
            .ctx
            .hitl
            .request_approval(run_id, conversation_id, channel_type, "suggest_skill", arguments, SUGGEST_SKILL_RISK)
            .await?;
        if !decision.approved {
            return Ok(format!("activation of '{name}' was not approved"));
        }

        self.ctx.tool_registry.set_enabled(name, true)?;
        Ok(format!("'{name}' is now active and callable"))
    }
}

struct DriveResult {
    text: String,
    input_tokens: i64,
    output_tokens: i64,
}

impl AgentLoop {
    /// Edge-mode completion: the whole request (no tool use, no hop loop)
    /// runs inside a throwaway sandbox instead of this process, per
    /// [`crate::container_runner::ContainerRunner`]. A conversation running
    /// in this mode can't call tools, since the sandbox's wire protocol
    /// carries only a plain completion request in and `{content,
    /// inputTokens, outputTokens}` (or `{error}`) back out.
    async fn drive_in_container(&self, preamble: &str, messages: &[Message]) -> Result<DriveResult> {
        let config = &self.ctx.config.static_config;
        let api_key = config
            .anthropic_api_key
            .clone()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("ANTHROPIC_API_KEY not configured")))?;
        let history = OneOrMany::many(messages.to_vec())
            .map_err(|_| AgentError::Other(anyhow::anyhow!("empty chat history")))?;

        let input = serde_json::json!({
            "api_key": api_key,
            "model": config.agent_model,
            "system_prompt": preamble,
            "messages": crate::llm::model::convert_messages_to_anthropic(&history),
            "max_tokens": config.agent_max_tokens,
        });

        let request = crate::container_runner::ContainerRequest {
            image: self.ctx.config.container.load().image.clone(),
            input,
            env: std::collections::HashMap::new(),
        };

        let output = self.ctx.container_runner.run(request).await?;
        if let Some(error) = output.get("error").and_then(|v| v.as_str()) {
            return Err(AgentError::Other(anyhow::anyhow!("sandboxed agent run failed: {error}")).into());
        }
        let text = output
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("sandboxed agent run returned no content")))?
            .to_string();
        let input_tokens = output.get("inputTokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let output_tokens = output.get("outputTokens").and_then(|v| v.as_i64()).unwrap_or(0);

        Ok(DriveResult { text, input_tokens, output_tokens })
    }
}

/// Flatten a persisted row into a plain-text turn. Tool-hop structure
/// (tool_use/tool_result pairing) only needs to survive within a single
/// in-flight turn's hop loop, which keeps its own `Vec<Message>` — once a
/// turn ends, only its final text reply is persisted, so prior turns
/// round-trip through this function as ordinary user/assistant text.
fn row_to_message(row: &MessageRow) -> Option<Message> {
    match row.role {
        MessageRole::User => Some(Message::User {
            content: OneOrMany::one(UserContent::text(&row.content)),
        }),
        MessageRole::Assistant => Some(Message::Assistant {
            id: None,
            content: OneOrMany::one(AssistantContent::text(&row.content)),
        }),
        MessageRole::Tool | MessageRole::System => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MessageRole as Role;

    fn row(role: Role, content: &str) -> MessageRow {
        MessageRow {
            id: 1,
            conversation_id: crate::ConversationId::new_v4(),
            branch_id: crate::BranchId::new_v4(),
            role,
            content: content.to_string(),
            inbound_channel_type: None,
            external_sender: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn user_and_assistant_rows_round_trip_as_text_messages() {
        let user = row_to_message(&row(Role::User, "hi")).unwrap();
        match user {
            Message::User { content } => match content.iter().next() {
                Some(UserContent::Text(t)) => assert_eq!(t.text, "hi"),
                _ => panic!("expected text content"),
            },
            _ => panic!("expected a user message"),
        }
    }

    #[test]
    fn tool_and_system_rows_are_dropped_from_history() {
        assert!(row_to_message(&row(Role::Tool, "result")).is_none());
        assert!(row_to_message(&row(Role::System, "note")).is_none());
    }
}
