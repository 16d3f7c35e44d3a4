// =============================================================================
// SessionHub — subscription multiplexer for long-lived client sessions
// =============================================================================
//
// Grounded on websocket_manager.py's connection registry / channel fan-out,
// re-expressed against the explicit `Bus` capability trait instead of a
// direct Redis client. One PubSubBridge handler is installed per channel on
// its first local subscriber and torn down when the last leaves; Broadcast
// applies each session's filters and enqueues onto that session's own
// outbound queue so one slow session can never stall delivery to the rest.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::{EngineError, EngineResult};
use crate::session::filters::Filters;

pub type SessionId = Uuid;

struct SessionState {
    id: SessionId,
    connected_at: i64,
    last_heartbeat_at: AtomicI64,
    channels: RwLock<HashMap<String, Filters>>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Tracks every live session and the reverse index from channel name to the
/// sessions currently subscribed to it.
pub struct SessionHub {
    bus: Arc<dyn Bus>,
    sessions: DashMap<SessionId, Arc<SessionState>>,
    channel_subscribers: DashMap<String, HashSet<SessionId>>,
    heartbeat_seconds: i64,
    self_ref: RwLock<Weak<SessionHub>>,
}

impl SessionHub {
    pub fn new(bus: Arc<dyn Bus>, heartbeat_seconds: i64) -> Arc<Self> {
        let hub = Arc::new(Self {
            bus,
            sessions: DashMap::new(),
            channel_subscribers: DashMap::new(),
            heartbeat_seconds,
            self_ref: RwLock::new(Weak::new()),
        });
        *hub.self_ref.write() = Arc::downgrade(&hub);
        hub
    }

    /// Register a new session backed by `outbound`, sending the initial
    /// `{type:"connected", ...}` frame. Returns the session id for the
    /// caller's read loop to key off of.
    pub fn accept(self: &Arc<Self>, outbound: mpsc::UnboundedSender<String>) -> SessionId {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp();
        let state = Arc::new(SessionState {
            id,
            connected_at: now,
            last_heartbeat_at: AtomicI64::new(now),
            channels: RwLock::new(HashMap::new()),
            outbound,
        });
        self.sessions.insert(id, state.clone());

        let _ = state.outbound.send(
            json!({ "type": "connected", "client_id": id.to_string(), "server_time": now }).to_string(),
        );
        debug!(session = %id, "session accepted");
        id
    }

    /// Subscribe `session_id` to `channel` with optional filters, sending
    /// `{type:"subscribed", ...}`. Idempotent: re-subscribing the same
    /// channel just replaces its filters, no duplicate bridge handler.
    pub fn subscribe(&self, session_id: SessionId, channel: &str, filters: Option<Value>) -> EngineResult<()> {
        let session = self.session_or_err(session_id)?;
        let filters = Filters::from_value(filters);

        let is_new = {
            let mut channels = session.channels.write();
            let already = channels.contains_key(channel);
            channels.insert(channel.to_string(), filters.clone());
            !already
        };

        if is_new {
            let mut subscribers = self.channel_subscribers.entry(channel.to_string()).or_default();
            let first_subscriber = subscribers.is_empty();
            subscribers.insert(session_id);
            drop(subscribers);

            if first_subscriber {
                self.install_bridge_handler(channel);
            }
        }

        let _ = session.outbound.send(
            json!({ "type": "subscribed", "channel": channel, "filters": filters.raw }).to_string(),
        );
        Ok(())
    }

    /// Unsubscribe `session_id` from `channel`, releasing the upstream
    /// bridge subscription once the last local subscriber leaves.
    pub fn unsubscribe(&self, session_id: SessionId, channel: &str) -> EngineResult<()> {
        let session = self.session_or_err(session_id)?;
        session.channels.write().remove(channel);
        self.remove_channel_subscriber(channel, session_id);

        let _ = session
            .outbound
            .send(json!({ "type": "unsubscribed", "channel": channel }).to_string());
        Ok(())
    }

    /// Record a heartbeat from `session_id`, replying `{type:"pong", ...}`.
    pub fn heartbeat(&self, session_id: SessionId) -> EngineResult<()> {
        let session = self.session_or_err(session_id)?;
        let now = Utc::now().timestamp();
        session.last_heartbeat_at.store(now, Ordering::SeqCst);
        let _ = session
            .outbound
            .send(json!({ "type": "pong", "timestamp": now }).to_string());
        Ok(())
    }

    /// Send a client protocol error frame without tearing down the session.
    pub fn send_protocol_error(&self, session_id: SessionId, message: &str) {
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session
                .value()
                .outbound
                .send(json!({ "type": "error", "message": message }).to_string());
        }
    }

    /// Move a session to Closed: remove it from every channel index and the
    /// registry. Idempotent — safe to call more than once for one session.
    pub fn disconnect(&self, session_id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            let channels: Vec<String> = session.channels.read().keys().cloned().collect();
            for channel in channels {
                self.remove_channel_subscriber(&channel, session_id);
            }
            debug!(session = %session_id, "session disconnected");
        }
    }

    pub fn connected_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether `session_id` is still registered. A connection task's own
    /// heartbeat tick uses this to notice it was reaped out from under it.
    pub fn is_live(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Reap sessions whose last heartbeat is older than `2 * heartbeat_seconds`.
    pub fn reap_stale_sessions(&self) {
        let now = Utc::now().timestamp();
        let timeout = 2 * self.heartbeat_seconds;
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| now - entry.value().last_heartbeat_at.load(Ordering::SeqCst) > timeout)
            .map(|entry| *entry.key())
            .collect();

        for id in stale {
            info!(session = %id, "heartbeat timeout, closing session");
            self.disconnect(id);
        }
    }

    /// Fan `message` out to every session subscribed to `channel`, applying
    /// each session's filters and rewriting the payload's data as needed.
    /// Invoked from the bridge handler's synchronous dispatch loop — must
    /// never block, so delivery is a non-blocking queue push.
    fn broadcast(&self, channel: &str, message: &str) {
        let Some(subscriber_ids) = self.channel_subscribers.get(channel).map(|s| s.clone()) else {
            return;
        };
        if subscriber_ids.is_empty() {
            return;
        }

        let parsed: Option<Value> = serde_json::from_str(message).ok();
        let mut failed = Vec::new();

        for session_id in subscriber_ids {
            let Some(session) = self.sessions.get(&session_id) else { continue };
            let filters = session.value().channels.read().get(channel).cloned();
            let Some(filters) = filters else { continue };

            let Some(payload) = apply_filters_to_message(channel, &parsed, message, &filters) else {
                continue;
            };

            if session.value().outbound.send(payload).is_err() {
                failed.push(session_id);
            }
        }

        for session_id in failed {
            warn!(session = %session_id, channel, "outbound queue closed, disconnecting session");
            self.disconnect(session_id);
        }
    }

    fn install_bridge_handler(&self, channel: &str) {
        let hub_weak = self.self_ref.read().clone();
        self.bus.subscribe(
            channel,
            Box::new(move |ch, msg| {
                if let Some(hub) = hub_weak.upgrade() {
                    hub.broadcast(ch, msg);
                }
            }),
        );
    }

    fn remove_channel_subscriber(&self, channel: &str, session_id: SessionId) {
        let mut remove_upstream = false;
        if let Some(mut subscribers) = self.channel_subscribers.get_mut(channel) {
            subscribers.remove(&session_id);
            remove_upstream = subscribers.is_empty();
        }
        if remove_upstream {
            self.channel_subscribers.remove(channel);
            self.bus.unsubscribe(channel);
        }
    }

    fn session_or_err(&self, session_id: SessionId) -> EngineResult<Arc<SessionState>> {
        self.sessions
            .get(&session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::Transport(format!("unknown session {session_id}")))
    }
}

/// Build the message actually delivered to one subscriber, honouring its
/// `symbols` filter: per-instrument messages are dropped outright if the
/// symbol doesn't match, aggregate messages are rewritten to the narrowed
/// `stocks`/`indices` array.
fn apply_filters_to_message(
    channel: &str,
    parsed: &Option<Value>,
    original: &str,
    filters: &Filters,
) -> Option<String> {
    let Some(symbols) = &filters.symbols else {
        return Some(original.to_string());
    };
    let Some(value) = parsed else {
        return Some(original.to_string());
    };

    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "stock_update" => {
            let symbol = value.pointer("/data/symbol").and_then(Value::as_str)?;
            symbols.contains(symbol).then(|| original.to_string())
        }
        "market_update" => {
            let stocks = value.pointer("/data/stocks").and_then(Value::as_array)?;
            let narrowed: Vec<&Value> = stocks
                .iter()
                .filter(|s| s.get("symbol").and_then(Value::as_str).map(|sym| symbols.contains(sym)).unwrap_or(false))
                .collect();
            if narrowed.is_empty() {
                return None;
            }
            let mut rewritten = value.clone();
            rewritten["data"]["stocks"] = json!(narrowed);
            Some(rewritten.to_string())
        }
        _ => {
            let _ = channel;
            Some(original.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use std::time::Duration;

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn accept_sends_connected_frame() {
        let hub = SessionHub::new(InProcessBus::new(), 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.accept(tx.clone());
        let msgs = drain(&mut rx);
        assert!(msgs[0].contains("\"type\":\"connected\""));
    }

    #[tokio::test]
    async fn subscribe_then_broadcast_delivers_to_session() {
        let bus = InProcessBus::new();
        let hub = SessionHub::new(bus.clone(), 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        hub.subscribe(id, "market:stocks", None).unwrap();
        drain(&mut rx);

        bus.publish("market:stocks", "{\"type\":\"market_update\",\"data\":{}}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = InProcessBus::new();
        let hub = SessionHub::new(bus.clone(), 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        hub.subscribe(id, "market:stocks", None).unwrap();
        hub.unsubscribe(id, "market:stocks").unwrap();
        drain(&mut rx);

        bus.publish("market:stocks", "{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn filtered_stock_update_is_dropped_when_symbol_not_in_set() {
        let bus = InProcessBus::new();
        let hub = SessionHub::new(bus.clone(), 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        hub.subscribe(id, "market:stocks", Some(json!({ "symbols": ["AAA"] }))).unwrap();
        drain(&mut rx);

        bus.publish(
            "market:stocks",
            "{\"type\":\"stock_update\",\"data\":{\"symbol\":\"BBB\"}}",
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_session_from_registry() {
        let hub = SessionHub::new(InProcessBus::new(), 30);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        assert_eq!(hub.connected_session_count(), 1);
        hub.disconnect(id);
        assert_eq!(hub.connected_session_count(), 0);
    }

    #[tokio::test]
    async fn stale_session_is_reaped() {
        let hub = SessionHub::new(InProcessBus::new(), 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        hub.sessions.get(&id).unwrap().last_heartbeat_at.store(0, Ordering::SeqCst);
        hub.reap_stale_sessions();
        assert_eq!(hub.connected_session_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_replies_with_pong() {
        let hub = SessionHub::new(InProcessBus::new(), 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.accept(tx.clone());
        drain(&mut rx);
        hub.heartbeat(id).unwrap();
        let msgs = drain(&mut rx);
        assert!(msgs[0].contains("\"type\":\"pong\""));
    }
}
