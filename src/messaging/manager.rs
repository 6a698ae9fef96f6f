//! MessagingManager: fan-in and routing for all adapters.

use crate::error::Result;
use crate::messaging::traits::{Messaging, MessagingDyn};
use crate::{ChannelType, ConnectionStatus, GatewayEvent, IncomingMessage, OutboundResponse};
use std::collections::HashMap;
use std::sync::Arc;

/// Manages all messaging adapters: owns their lifecycle, fans every
/// adapter's inbound stream into the conversation router, and relays
/// connection-status changes onto the event bus.
pub struct MessagingManager {
    adapters: HashMap<String, Arc<dyn MessagingDyn>>,
    ctx: crate::AppContext,
    router: Arc<crate::conversation::ConversationRouter>,
}

impl MessagingManager {
    pub fn new(ctx: crate::AppContext, router: Arc<crate::conversation::ConversationRouter>) -> Self {
        Self {
            adapters: HashMap::new(),
            ctx,
            router,
        }
    }

    /// Register an adapter. Adapters are keyed by name (matching their
    /// `ChannelType`'s `Display` form).
    pub fn register(&mut self, adapter: impl Messaging) {
        let name = adapter.name().to_string();
        self.adapters.insert(name, Arc::new(adapter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessagingDyn>> {
        self.adapters.get(name).cloned()
    }

    /// Start every registered adapter and spawn a task per adapter that
    /// forwards its inbound stream into the conversation router. Each
    /// adapter's own reconnection policy lives inside `start()`/its
    /// gateway client; this only owns the fan-in.
    pub async fn start_all(self: Arc<Self>, channel_id_by_type: HashMap<String, crate::ChannelId>) -> Result<()> {
        use futures::StreamExt as _;

        for (name, adapter) in self.adapters.clone() {
            let manager = self.clone();
            let channel_id = channel_id_by_type.get(&name).copied();
            tokio::spawn(async move {
                let mut stream = match adapter.start().await {
                    Ok(stream) => stream,
                    Err(error) => {
                        tracing::error!(adapter = %name, %error, "adapter failed to start");
                        if let Some(channel_id) = channel_id {
                            manager.ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                                channel_id,
                                status: ConnectionStatus::Error,
                                last_error: Some(error.to_string()),
                            });
                        }
                        return;
                    }
                };

                if let Some(channel_id) = channel_id {
                    manager.ctx.event_bus.publish(GatewayEvent::AdapterStatus {
                        channel_id,
                        status: ConnectionStatus::Connected,
                        last_error: None,
                    });
                }

                while let Some(incoming) = stream.next().await {
                    if let Err(error) = manager.router.handle(incoming).await {
                        tracing::error!(adapter = %name, %error, "failed to route inbound message");
                    }
                }
            });
        }

        Ok(())
    }

    /// Deliver an outbound response to the adapter that owns `channel_type`.
    pub async fn respond(
        &self,
        channel_type: ChannelType,
        message: &IncomingMessage,
        response: OutboundResponse,
    ) -> Result<()> {
        match self.adapters.get(&channel_type.to_string()) {
            Some(adapter) => adapter.respond(message, response).await,
            None => Err(crate::error::MessagingError::NotConnected {
                adapter: channel_type.to_string(),
            }
            .into()),
        }
    }

    pub async fn health_check_all(&self) {
        for (name, adapter) in &self.adapters {
            if let Err(error) = adapter.health_check().await {
                tracing::warn!(adapter = %name, %error, "adapter health check failed");
            }
        }
    }
}
