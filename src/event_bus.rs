//! Process-wide pub/sub for [`crate::GatewayEvent`].
//!
//! A thin wrapper over `tokio::sync::broadcast` so callers don't need to
//! remember the channel capacity or deal with `RecvError::Lagged`
//! themselves. Any number of subscribers can listen (status dashboards,
//! adapters relaying status updates back to a channel, test harnesses);
//! none of them block publishers.

use crate::GatewayEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; zero subscribers is not an error.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConversationId;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let conversation_id = ConversationId::new_v4();
        bus.publish(GatewayEvent::MessageReceived {
            channel_id: ConversationId::new_v4(),
            conversation_id,
        });
        let received = rx.recv().await.unwrap();
        match received {
            GatewayEvent::MessageReceived { conversation_id: id, .. } => {
                assert_eq!(id, conversation_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::RunStarted {
            run_id: ConversationId::new_v4(),
            conversation_id: ConversationId::new_v4(),
        });
    }
}
