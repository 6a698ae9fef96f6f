//! Conversation Router: the front door every inbound message passes
//! through before it reaches the agent loop.
//!
//! Per conversation it holds a `processing` flag and a pending-message
//! queue: a conversation only ever has one agent turn in flight, so a
//! second message arriving mid-turn is queued rather than starting a
//! second, racing turn against the same branch. Slash commands
//! (`/approve`, `/reject`, `/reset`, `/status`) are intercepted before
//! the queue — they act on the conversation directly and never reach the
//! model.
use crate::agent::{AgentLoop, TurnOutcome};
use crate::error::Result;
use crate::{ConversationId, IncomingMessage, OutboundResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Mutex as AsyncMutex;

/// Per-conversation in-flight state: whether a turn is currently running,
/// and messages that arrived while it was.
#[derive(Default)]
struct ConversationState {
    processing: bool,
    queue: Vec<IncomingMessage>,
}

pub struct ConversationRouter {
    ctx: crate::AppContext,
    states: Mutex<HashMap<ConversationId, ConversationState>>,
    // Serializes queue draining per conversation so two concurrent
    // inbound messages can't both see `processing == false` and both
    // start a turn.
    drain_lock: AsyncMutex<()>,
    // Bound once at startup, after `MessagingManager` is constructed (it
    // is itself constructed with a reference to this router, so the two
    // can't be wired in a single step). `None` only during that brief
    // startup window; a turn finishing before binding simply drops its
    // reply, which never happens in practice since adapters aren't
    // started until after `bind_manager` runs.
    manager: OnceLock<Arc<crate::messaging::MessagingManager>>,
}

/// Minimum spacing between agent-loop invocations for one conversation,
/// a simple budget gate backed by `ApiCallLogStore::count_since`.
const BUDGET_WINDOW_SECS: i64 = 60;
const BUDGET_MAX_CALLS_PER_WINDOW: i64 = 20;

impl ConversationRouter {
    pub fn new(ctx: crate::AppContext) -> Self {
        Self {
            ctx,
            states: Mutex::new(HashMap::new()),
            drain_lock: AsyncMutex::new(()),
            manager: OnceLock::new(),
        }
    }

    /// Bind the `MessagingManager` that owns the adapters, so completed
    /// turns (and slash-command acks) can be delivered back out. Called
    /// once from startup wiring; a second call is a no-op.
    pub fn bind_manager(&self, manager: Arc<crate::messaging::MessagingManager>) {
        let _ = self.manager.set(manager);
    }

    /// Deliver a turn's outcome back through the adapter that owns
    /// `incoming`'s channel. A failed turn gets a generic apology rather
    /// than the raw error, per the error-handling policy: anything that
    /// escapes the agent loop becomes a user-facing apology plus a
    /// structured `run:error` event (already published by the loop).
    async fn deliver(&self, incoming: &IncomingMessage, outcome: &TurnOutcome) {
        let Some(manager) = self.manager.get() else {
            return;
        };
        let response = match outcome {
            TurnOutcome::Replied { text, .. } => OutboundResponse::Text(text.clone()),
            TurnOutcome::Failed { .. } => OutboundResponse::Text(
                "Sorry, something went wrong handling that message.".to_string(),
            ),
        };
        if let Err(error) = manager.respond(incoming.channel_type, incoming, response).await {
            tracing::error!(%error, channel_id = %incoming.channel_id, "failed to deliver reply");
        }
    }

    /// Send the short "still working" ack for a message that arrived while
    /// its conversation already has a turn in flight.
    async fn send_queued_ack(&self, incoming: &IncomingMessage) {
        let Some(manager) = self.manager.get() else {
            return;
        };
        let response = OutboundResponse::Text(
            "I'm still working on your last message, one moment…".to_string(),
        );
        if let Err(error) = manager.respond(incoming.channel_type, incoming, response).await {
            tracing::error!(%error, channel_id = %incoming.channel_id, "failed to deliver queued ack");
        }
    }

    /// Entry point for every inbound message. Returns the reply text to
    /// send back immediately for a slash command, or `None` if the
    /// message was queued/dispatched to the agent loop (whose reply, if
    /// any, arrives asynchronously via the event bus / adapter callback).
    pub async fn handle(&self, incoming: IncomingMessage) -> Result<Option<OutboundResponse>> {
        if let Some(command) = slash_command(&incoming.text) {
            return self.handle_slash_command(&incoming, command).await;
        }

        if self.enqueue(incoming.clone()).await {
            self.send_queued_ack(&incoming).await;
        }
        self.drain().await?;
        Ok(None)
    }

    /// Run a turn directly, bypassing the per-conversation queue, and
    /// return its outcome. Used by callers that need the reply inline —
    /// a synchronous webhook HTTP response — and are willing to block
    /// for the duration of the turn rather than being relayed the result
    /// later via the event bus.
    pub async fn handle_sync(&self, incoming: IncomingMessage) -> Result<crate::agent::TurnOutcome> {
        if let Some(command) = slash_command(&incoming.text) {
            let reply = self.handle_slash_command(&incoming, command).await?;
            let conversation = self
                .ctx
                .db
                .conversations()
                .get_or_create(incoming.channel_id, &incoming.external_chat_id)
                .await?;
            let text = match reply {
                Some(OutboundResponse::Text(t)) => t,
                _ => String::new(),
            };
            return Ok(crate::agent::TurnOutcome::Replied {
                run_id: crate::RunId::new_v4(),
                conversation_id: conversation.id,
                text,
            });
        }

        AgentLoop::new(self.ctx.clone()).run_turn(&incoming).await
    }

    /// Queue `incoming` for its conversation. Returns `true` if a turn was
    /// already in flight for that conversation (so the caller should send
    /// a "still working" ack) or `false` if this is the first queued
    /// message and `drain` will pick it up directly.
    async fn enqueue(&self, incoming: IncomingMessage) -> bool {
        let mut states = self.states.lock().unwrap();
        let key = conversation_key(&incoming);
        let state = states.entry(key).or_default();
        let was_processing = state.processing;
        state.queue.push(incoming);
        #[cfg(feature = "metrics")]
        crate::metrics::Metrics::global()
            .conversation_queue_depth
            .with_label_values(&[&key.to_string()])
            .set(state.queue.len() as i64);
        was_processing
    }

    /// Pop the next conversation with queued work and no turn in flight,
    /// merge whatever queued up behind it into a single follow-up turn,
    /// and run the agent loop. The `drain_lock` only covers picking the
    /// conversation and claiming its batch — a plain, non-suspending
    /// critical section — so the agent run itself never holds it and
    /// unrelated conversations' turns run concurrently.
    async fn drain(&self) -> Result<()> {
        let next = {
            let _guard = self.drain_lock.lock().await;
            let mut states = self.states.lock().unwrap();
            let key = states
                .iter()
                .find(|(_, s)| !s.processing && !s.queue.is_empty())
                .map(|(k, _)| *k);
            let Some(key) = key else { return Ok(()) };
            let state = states.get_mut(&key).unwrap();
            state.processing = true;
            let batch = std::mem::take(&mut state.queue);
            #[cfg(feature = "metrics")]
            crate::metrics::Metrics::global()
                .conversation_queue_depth
                .with_label_values(&[&key.to_string()])
                .set(0);
            (key, batch)
        };

        let (key, batch) = next;
        // Whatever queued up behind the in-flight turn — one message or
        // several — collapses into exactly one follow-up run.
        let turn = merge_batch(batch);

        let result = if self.budget_allows(&turn).await? {
            let agent_loop = AgentLoop::new(self.ctx.clone());
            match agent_loop.run_turn(&turn).await {
                Ok(outcome) => {
                    self.deliver(&turn, &outcome).await;
                    Ok(())
                }
                Err(error) => Err(error),
            }
        } else {
            tracing::warn!(channel_id = %turn.channel_id, "conversation rate budget exceeded, skipping turn");
            Ok(())
        };

        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(&key) {
                state.processing = false;
            }
        }

        result?;

        // Recurse so a backlog that grew while this turn ran gets drained too.
        Box::pin(self.drain()).await
    }

    async fn budget_allows(&self, incoming: &IncomingMessage) -> Result<bool> {
        let conversation = self
            .ctx
            .db
            .conversations()
            .get_or_create(incoming.channel_id, &incoming.external_chat_id)
            .await?;
        let since = chrono::Utc::now() - chrono::Duration::seconds(BUDGET_WINDOW_SECS);
        let count = self.ctx.db.api_calls().count_since(conversation.id, since).await?;
        Ok(count < BUDGET_MAX_CALLS_PER_WINDOW)
    }

    async fn handle_slash_command(
        &self,
        incoming: &IncomingMessage,
        command: SlashCommand<'_>,
    ) -> Result<Option<OutboundResponse>> {
        let conversation = self
            .ctx
            .db
            .conversations()
            .get_or_create(incoming.channel_id, &incoming.external_chat_id)
            .await?;

        let text = match command {
            SlashCommand::Approve(id) | SlashCommand::Reject(id) => {
                let approved = matches!(command, SlashCommand::Approve(_));
                match id.parse::<crate::ApprovalId>() {
                    Ok(approval_id) => {
                        self.ctx
                            .hitl
                            .respond(approval_id, approved, &incoming.sender, None)
                            .await?;
                        format!("approval {approval_id} {}", if approved { "approved" } else { "rejected" })
                    }
                    Err(_) => format!("'{id}' is not a valid approval id"),
                }
            }
            SlashCommand::Reset => match conversation.active_branch_id {
                Some(branch_id) => {
                    let cleared = self.ctx.db.conversations().clear_branch_messages(branch_id).await?;
                    format!("cleared {cleared} message(s)")
                }
                None => "conversation has no active branch".to_string(),
            },
            SlashCommand::Status => match conversation.active_branch_id {
                Some(branch_id) => {
                    let count = self.ctx.db.conversations().count_messages(branch_id).await?;
                    format!("conversation {} has {} message(s)", conversation.id, count)
                }
                None => format!("conversation {} has no active branch", conversation.id),
            },
        };

        Ok(Some(OutboundResponse::Text(text)))
    }
}

fn conversation_key(incoming: &IncomingMessage) -> ConversationId {
    // The router keys in-flight state by channel + external chat id via a
    // deterministic UUID so two inbound messages for the same chat always
    // land in the same bucket without an extra DB round trip.
    uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        format!("{}:{}", incoming.channel_id, incoming.external_chat_id).as_bytes(),
    )
}

/// Merge a batch of queued messages into a single prompt: if there's
/// only one, pass it through unchanged; otherwise frame each message
/// with its one-based arrival order (`[Message N]: …`) and join them
/// with a blank line, attributed to the last sender.
fn merge_batch(mut batch: Vec<IncomingMessage>) -> IncomingMessage {
    if batch.len() == 1 {
        return batch.pop().unwrap();
    }
    let last = batch.last().cloned().expect("batch is non-empty");
    let merged_text = batch
        .iter()
        .enumerate()
        .map(|(i, m)| format!("[Message {}]: {}", i + 1, m.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    IncomingMessage {
        text: merged_text,
        ..last
    }
}

enum SlashCommand<'a> {
    Approve(&'a str),
    Reject(&'a str),
    Reset,
    Status,
}

fn slash_command(text: &str) -> Option<SlashCommand<'_>> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("/approve ") {
        return Some(SlashCommand::Approve(rest.trim()));
    }
    if let Some(rest) = trimmed.strip_prefix("/reject ") {
        return Some(SlashCommand::Reject(rest.trim()));
    }
    if trimmed == "/reset" {
        return Some(SlashCommand::Reset);
    }
    if trimmed == "/status" {
        return Some(SlashCommand::Status);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(channel_id: crate::ChannelId, text: &str) -> IncomingMessage {
        IncomingMessage {
            channel_id,
            channel_type: crate::ChannelType::Webhook,
            external_chat_id: "chat-1".to_string(),
            sender: "alice".to_string(),
            text: text.to_string(),
            chat_title: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert!(matches!(slash_command("/reset"), Some(SlashCommand::Reset)));
        assert!(matches!(slash_command("/status"), Some(SlashCommand::Status)));
        assert!(matches!(slash_command("/approve abc-123"), Some(SlashCommand::Approve("abc-123"))));
        assert!(slash_command("hello").is_none());
    }

    #[test]
    fn merge_batch_frames_each_message_with_its_arrival_order() {
        let channel_id = crate::ChannelId::new_v4();
        let batch = vec![msg(channel_id, "a"), msg(channel_id, "b"), msg(channel_id, "c")];
        let merged = merge_batch(batch);
        assert_eq!(merged.text, "[Message 1]: a\n\n[Message 2]: b\n\n[Message 3]: c");
    }

    #[test]
    fn merge_batch_passes_single_message_through() {
        let channel_id = crate::ChannelId::new_v4();
        let batch = vec![msg(channel_id, "only")];
        let merged = merge_batch(batch);
        assert_eq!(merged.text, "only");
    }

    #[test]
    fn conversation_key_is_stable_for_the_same_chat() {
        let channel_id = crate::ChannelId::new_v4();
        let a = msg(channel_id, "hi");
        let b = msg(channel_id, "there");
        assert_eq!(conversation_key(&a), conversation_key(&b));
    }
}
