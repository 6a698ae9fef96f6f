//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{IncomingMessage, OutboundResponse};
use futures::Stream;
use std::pin::Pin;

pub type InboundStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Presence/progress signal an adapter can show while a turn is running.
/// Not every platform supports this; adapters that don't, no-op it.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Thinking,
    StopTyping,
    ToolStarted { tool_name: String },
    ToolCompleted { tool_name: String },
}

/// Static trait for messaging adapters. Use this for type-safe
/// implementations; [`MessagingDyn`] below is the object-safe companion
/// [`crate::messaging::manager::MessagingManager`] stores adapters behind.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this adapter, matching its [`crate::ChannelType`].
    fn name(&self) -> &str;

    /// Start the adapter and return its inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send a response for a given inbound message's originating chat.
    fn respond(
        &self,
        message: &IncomingMessage,
        response: OutboundResponse,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Send a status update (typing indicator, tool progress).
    fn send_status(
        &self,
        _message: &IncomingMessage,
        _status: StatusUpdate,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Health check used by the reconnection/status sweep.
    fn health_check(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism: use this when storing
/// different adapters behind `Arc<dyn MessagingDyn>`.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn respond<'a>(
        &'a self,
        message: &'a IncomingMessage,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn send_status<'a>(
        &'a self,
        message: &'a IncomingMessage,
        status: StatusUpdate,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn health_check<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(Messaging::start(self))
    }

    fn respond<'a>(
        &'a self,
        message: &'a IncomingMessage,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::respond(self, message, response))
    }

    fn send_status<'a>(
        &'a self,
        message: &'a IncomingMessage,
        status: StatusUpdate,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::send_status(self, message, status))
    }

    fn health_check<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::health_check(self))
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::shutdown(self))
    }
}

/// Split `text` into chunks no larger than `limit` bytes, preferring to
/// break on paragraph boundaries (`\n\n`) and falling back to plain
/// lines when a single paragraph exceeds the limit on its own.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let candidate_len = current.len() + if current.is_empty() { 0 } else { 2 } + paragraph.len();
        if candidate_len <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph.len() <= limit {
            current = paragraph.to_string();
            continue;
        }

        for line in paragraph.split('\n') {
            if current.len() + line.len() + 1 > limit {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                if line.len() > limit {
                    for window in line.as_bytes().chunks(limit) {
                        chunks.push(String::from_utf8_lossy(window).to_string());
                    }
                    continue;
                }
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_splits_on_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn chunks_never_exceed_the_limit() {
        let text = "word ".repeat(500);
        for chunk in chunk_text(&text, 100) {
            assert!(chunk.len() <= 100, "chunk of len {} exceeds limit", chunk.len());
        }
    }
}
