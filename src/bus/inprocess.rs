// =============================================================================
// InProcessBus — broadcast-channel-backed `Bus` implementation
// =============================================================================
//
// Each channel name maps to one `tokio::sync::broadcast` channel and one
// spawned receive task (the "upstream subscription"). `publish` sends into
// the broadcast channel; lagging/absent receivers simply miss messages —
// the same "stream paused, no error surfaced" behaviour §4.7 asks for.
// Registered handlers are dispatched synchronously from the receive task, so
// a handler that blocks would stall delivery for that channel; callers are
// expected to offload real work (this system's only caller, SessionHub,
// enqueues onto per-session queues and returns immediately).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, MessageHandler};
use crate::error::EngineResult;

/// Ring buffer depth per channel. A slow or absent consumer drops the
/// oldest buffered message first once this fills, matching the
/// bounded-queue/drop-oldest failure mode described in §4.7.
const CHANNEL_CAPACITY: usize = 256;

struct ChannelState {
    sender: broadcast::Sender<String>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    receive_task: JoinHandle<()>,
}

pub struct InProcessBus {
    channels: DashMap<String, ChannelState>,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { channels: DashMap::new() })
    }

    fn ensure_channel(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(state) = self.channels.get(channel) {
            return state.sender.clone();
        }

        let (sender, mut receiver) = broadcast::channel(CHANNEL_CAPACITY);
        let handlers: Arc<RwLock<Vec<MessageHandler>>> = Arc::new(RwLock::new(Vec::new()));
        let task_handlers = handlers.clone();
        let task_channel = channel.to_string();

        let receive_task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let hs = task_handlers.read();
                        for handler in hs.iter() {
                            handler(&task_channel, &message);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %task_channel, skipped, "bus receiver lagged, dropped oldest messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(channel = %task_channel, "upstream subscription closed");
                        break;
                    }
                }
            }
        });

        self.channels.insert(
            channel.to_string(),
            ChannelState { sender: sender.clone(), handlers, receive_task },
        );
        sender
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish(&self, channel: &str, message: &str) -> EngineResult<()> {
        let sender = self.ensure_channel(channel);
        // No receivers is not an error: a channel with zero subscribers
        // simply produces no deliveries, per §4.7's "stream paused" model.
        match sender.send(message.to_string()) {
            Ok(_) => trace!(channel, "published"),
            Err(_) => trace!(channel, "published with no subscribers"),
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: MessageHandler) {
        self.ensure_channel(channel);
        if let Some(state) = self.channels.get(channel) {
            state.handlers.write().push(handler);
        }
    }

    fn unsubscribe(&self, channel: &str) {
        if let Some((_, state)) = self.channels.remove(channel) {
            state.handlers.write().clear();
            state.receive_task.abort();
        }
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.handlers.read().len()).unwrap_or(0)
    }

    async fn close(&self) {
        for entry in self.channels.iter() {
            entry.value().receive_task.abort();
        }
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn publish_before_subscribe_does_not_error() {
        let bus = InProcessBus::new();
        bus.publish("market:stocks", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = InProcessBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        bus.subscribe(
            "market:stocks",
            Box::new(move |_ch, _msg| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("market:stocks", "{\"type\":\"market_update\"}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_upstream_subscription() {
        let bus = InProcessBus::new();
        bus.subscribe("market:indices", Box::new(|_ch, _msg| {}));
        assert_eq!(bus.subscriber_count("market:indices"), 1);

        bus.unsubscribe("market:indices");
        assert_eq!(bus.subscriber_count("market:indices"), 0);
    }

    #[tokio::test]
    async fn zero_subscriber_channel_has_no_subscriber_count() {
        let bus = InProcessBus::new();
        assert_eq!(bus.subscriber_count("market:stock:AAA"), 0);
    }
}
