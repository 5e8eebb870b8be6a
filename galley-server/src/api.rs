//! Route table

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(ws::ws_upgrade))
        .route("/internal/tenants/:tenant_id/events", post(handlers::relay_event))
        .with_state(state)
}
