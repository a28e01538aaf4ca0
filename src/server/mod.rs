pub mod routes;
pub mod ws;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// REST + WS status surface. Reads come from the watch snapshot or the
/// database; writes go through the control channel.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/window", get(routes::get_window))
        .route("/api/events", get(routes::get_events))
        .route("/api/decisions", get(routes::get_decisions))
        .route("/api/budget", get(routes::get_budget))
        .route("/api/counters", get(routes::get_counters))
        .route("/api/control/start", post(routes::post_start))
        .route("/api/control/stop", post(routes::post_stop))
        .route("/ws", get(ws::ws_handler))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
