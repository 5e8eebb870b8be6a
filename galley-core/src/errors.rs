//! Error taxonomy of the collaboration core
//!
//! Every command failure is caught at the dispatch boundary and turned into
//! an `error` event for the caller only. Nothing here is ever broadcast.

use thiserror::Error;

use crate::persistence::StoreError;

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Handshake-time identity or membership failure
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Access or ownership check failed
    #[error("{0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Wire code carried by the `error` event
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Authentication(_) => "unauthenticated",
            RealtimeError::Authorization(_) => "forbidden",
            RealtimeError::NotFound(_) => "not_found",
            RealtimeError::Persistence(_) => "persistence_failed",
            RealtimeError::InvalidCommand(_) => "invalid_command",
            RealtimeError::ConnectionClosed => "connection_closed",
            RealtimeError::Internal(_) => "internal",
        }
    }

    /// Text safe to show the caller. Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            RealtimeError::Persistence(_) => "failed to save changes".to_string(),
            RealtimeError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Failures caused by the caller rather than the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RealtimeError::Authentication(_)
                | RealtimeError::Authorization(_)
                | RealtimeError::NotFound(_)
                | RealtimeError::InvalidCommand(_)
                | RealtimeError::ConnectionClosed
        )
    }

    pub fn access_denied() -> Self {
        RealtimeError::Authorization("channel access denied".to_string())
    }
}
