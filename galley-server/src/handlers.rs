//! HTTP handlers: health and the internal domain event relay

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use galley_core::types::TenantId;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::types::{HealthResponse, RelayRequest, RelayResponse};

/// Token from an `Authorization: Bearer <token>` header
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Compare through BLAKE3 digests; `blake3::Hash` equality is constant time
fn token_matches(presented: &str, expected: &str) -> bool {
    blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.shutdown.is_shutting_down().await { "shutting_down" } else { "ok" };
    Json(HealthResponse {
        status: status.to_string(),
        active_connections: state.gateway.active_connections().await,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /internal/tenants/:tenant_id/events
pub async fn relay_event(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RelayRequest>,
) -> ApiResult<Json<RelayResponse>> {
    if let Some(expected) = state.server.relay_token.as_deref() {
        match bearer_token(&headers) {
            Some(presented) if token_matches(presented, expected) => {}
            _ => return Err(ApiError::Unauthorized("invalid relay token".to_string())),
        }
    }

    let tenant = TenantId::new(tenant_id);
    let delivered = state.gateway.relay().broadcast(&tenant, &request.event_type, request.payload).await?;
    debug!(tenant_id = %tenant, event_type = %request.event_type, delivered, "Relay request served");
    Ok(Json(RelayResponse { delivered }))
}
