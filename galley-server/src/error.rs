//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use galley_core::RealtimeError;
use thiserror::Error;
use tracing::error;

use crate::types::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Realtime(e) => match e {
                RealtimeError::Authentication(_) => StatusCode::UNAUTHORIZED,
                RealtimeError::Authorization(_) => StatusCode::FORBIDDEN,
                RealtimeError::NotFound(_) => StatusCode::NOT_FOUND,
                RealtimeError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
                RealtimeError::ConnectionClosed => StatusCode::GONE,
                RealtimeError::Persistence(_) | RealtimeError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            ApiError::Unauthorized(reason) => {
                ErrorResponse { error: reason.clone(), code: "unauthenticated".to_string() }
            }
            ApiError::Unavailable(reason) => {
                ErrorResponse { error: reason.clone(), code: "unavailable".to_string() }
            }
            ApiError::Realtime(e) => {
                ErrorResponse { error: e.client_message(), code: e.code().to_string() }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && !matches!(self, ApiError::Unavailable(_)) {
            error!(error = %self, "Request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
