// =============================================================================
// WebSocket Handlers — the three subscription multiplexer endpoints
// =============================================================================
//
// Each endpoint upgrades the connection, accepts it into the SessionHub,
// auto-subscribes to its preset default channel, and then runs a
// `tokio::select!` loop between reading client frames, draining the
// session's outbound queue, and a heartbeat-interval tick that notices if
// the hub's reaper has already closed this session out from under it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::publisher::{stock_channel, CHANNEL_INDICES, CHANNEL_STOCKS};
use crate::session::SessionId;

#[derive(Deserialize)]
pub struct MarketQuery {
    symbols: Option<String>,
}

pub async fn market_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketQuery>,
) -> impl IntoResponse {
    let filters = query.symbols.map(|csv| {
        let symbols: Vec<String> =
            csv.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
        json!({ "symbols": symbols })
    });
    ws.on_upgrade(move |socket| run_session(socket, state, CHANNEL_STOCKS.to_string(), filters))
}

pub async fn indices_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state, CHANNEL_INDICES.to_string(), None))
}

pub async fn stock_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let channel = stock_channel(&symbol.to_uppercase());
    ws.on_upgrade(move |socket| run_session(socket, state, channel, None))
}

/// Drive one accepted connection until it closes: auto-subscribe to the
/// endpoint's default channel, send the welcome frame, then alternate
/// between forwarding outbound bus traffic, dispatching client frames, and
/// noticing a heartbeat-timeout reap via the periodic liveness check.
async fn run_session(socket: WebSocket, state: Arc<AppState>, default_channel: String, default_filters: Option<Value>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let session_id = state.sessions.accept(tx.clone());

    if let Err(err) = state.sessions.subscribe(session_id, &default_channel, default_filters.clone()) {
        warn!(error = %err, "failed to auto-subscribe new session");
        state.sessions.disconnect(session_id);
        return;
    }
    let _ = tx.send(
        json!({
            "type": "welcome",
            "message": "connected to aurora-market",
            "channel": default_channel,
            "filters": default_filters,
        })
        .to_string(),
    );

    let mut heartbeat = tokio::time::interval(Duration::from_secs(state.config.heartbeat_seconds.max(1)));
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if sender.send(Message::Text(message.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, session_id, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket transport error, closing session");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if !state.sessions.is_live(session_id) {
                    debug!(session = %session_id, "session reaped by heartbeat timeout, closing transport");
                    break;
                }
            }
        }
    }

    state.sessions.disconnect(session_id);
}

fn handle_client_frame(state: &Arc<AppState>, session_id: SessionId, text: &str) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            state.sessions.send_protocol_error(session_id, "malformed JSON");
            return;
        }
    };

    let msg_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "ping" => {
            let _ = state.sessions.heartbeat(session_id);
        }
        "subscribe" => {
            let Some(channel) = parsed.get("channel").and_then(Value::as_str) else {
                state.sessions.send_protocol_error(session_id, "subscribe requires a channel");
                return;
            };
            let filters = parsed.get("filters").cloned();
            let _ = state.sessions.subscribe(session_id, channel, filters);
        }
        "unsubscribe" => {
            let Some(channel) = parsed.get("channel").and_then(Value::as_str) else {
                state.sessions.send_protocol_error(session_id, "unsubscribe requires a channel");
                return;
            };
            let _ = state.sessions.unsubscribe(session_id, channel);
        }
        "snapshot" => {
            state.sessions.send_protocol_error(session_id, "Snapshot not implemented");
        }
        other => {
            state.sessions.send_protocol_error(session_id, &format!("Unknown message type: {other}"));
        }
    }
}
