use crate::db;
use crate::state::{AppState, ControlCommand, ControlSnapshot};
use axum::extract::{Query, State};
use axum::response::Json;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(serde::Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize)]
pub struct DecisionsQuery {
    pub gate: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/status -- latest control snapshot (from watch channel, no lock)
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ControlSnapshot> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(snapshot)
}

/// GET /api/window -- operating window as seen from now
pub async fn get_window(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let info = state.clock.get_operating_window_info(now);
    Json(serde_json::json!({
        "now": now,
        "window": info,
        "holiday": state.clock.calendar().holiday_name(state.clock.exchange_date(now)),
    }))
}

/// GET /api/events -- emergency log, newest first (cold path)
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(50).min(500);
    match db::get_recent_events(&state.db, limit) {
        Ok(events) => Json(serde_json::json!({ "events": events })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/decisions -- gate audit trail (cold path)
pub async fn get_decisions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DecisionsQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(100).min(1000);
    match db::get_recent_decisions(&state.db, params.gate.as_deref(), limit) {
        Ok(rows) => Json(serde_json::json!({ "decisions": rows })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/budget -- end-of-day budget snapshots
pub async fn get_budget(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(30).min(365);
    let current = state.snapshot_rx.borrow().budget;
    match db::get_budget_snapshots(&state.db, limit) {
        Ok(rows) => Json(serde_json::json!({ "current": current, "history": rows })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.counters.to_json())
}

/// POST /api/control/start
pub async fn post_start(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    control(&state, |reply| ControlCommand::Start { reply }).await
}

/// POST /api/control/stop
pub async fn post_stop(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    control(&state, |reply| ControlCommand::Stop { reply }).await
}

async fn control(
    state: &AppState,
    make: impl FnOnce(oneshot::Sender<bool>) -> ControlCommand,
) -> Json<serde_json::Value> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.control_tx.send(make(reply_tx)).await.is_err() {
        return Json(serde_json::json!({ "error": "control task unavailable" }));
    }
    match reply_rx.await {
        Ok(changed) => {
            let engine_state = state.snapshot_rx.borrow().engine_state;
            Json(serde_json::json!({ "changed": changed, "engine_state": engine_state }))
        }
        Err(_) => Json(serde_json::json!({ "error": "control task dropped the request" })),
    }
}
