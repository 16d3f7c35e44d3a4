// =============================================================================
// Bus Module — PubSubBridge's capability interface
// =============================================================================
//
// `Bus` is the explicit capability interface per the design notes ("replace
// dynamic dispatch with explicit capability interfaces"): publish, subscribe,
// unsubscribe, close. `InProcessBus` is the shipped implementation; a
// network-backed implementation (Redis or similar) can be swapped in behind
// the same trait without touching PubSubBridge or SessionHub.

pub mod inprocess;

pub use inprocess::InProcessBus;

use async_trait::async_trait;

use crate::error::EngineResult;

/// A handler invoked once per message delivered on a subscribed channel.
/// Handlers must not block — PubSubBridge offloads delivery to each
/// session's own outbound queue, so a slow consumer never stalls the bus's
/// receive loop.
pub type MessageHandler = Box<dyn Fn(&str, &str) + Send + Sync>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `message` (UTF-8 JSON) to `channel`. Fire-and-forget: failures
    /// are logged, never propagated to the tick pipeline.
    async fn publish(&self, channel: &str, message: &str) -> EngineResult<()>;

    /// Register `handler` on `channel`. Idempotent with respect to the
    /// upstream subscription: the first handler on a channel establishes it,
    /// subsequent handlers share it.
    fn subscribe(&self, channel: &str, handler: MessageHandler);

    /// Drop `channel`'s handlers. When the last handler leaves, the upstream
    /// subscription for that channel is released.
    fn unsubscribe(&self, channel: &str);

    /// Returns the number of registered handlers currently on `channel`
    /// (0 means no upstream subscription is held).
    fn subscriber_count(&self, channel: &str) -> usize;

    /// Cancel the bus's receive loop and release its resources.
    async fn close(&self);
}
