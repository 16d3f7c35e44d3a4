// =============================================================================
// /healthz — operational liveness check
// =============================================================================
//
// Ambient infrastructure, not a CRUD collaborator: reports process liveness
// and the session hub's connected-session count for external monitoring.
// =============================================================================

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthReport {
    status: &'static str,
    uptime_seconds: u64,
    connected_sessions: usize,
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        uptime_seconds: state.uptime_seconds(),
        connected_sessions: state.connected_session_count(),
    })
}
