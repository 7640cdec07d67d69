//! Engine Error Taxonomy
//! Mission: Classify every failure the engine can produce into a recoverable/non-recoverable kind

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

/// Errors the engine surfaces to its callers. Kinds, not type names: each variant
/// is a distinct failure mode with its own recovery and propagation rule (see §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid transition for position {position_id}: {from} -> {to}")]
    InvalidTransition {
        position_id: String,
        from: String,
        to: String,
    },

    #[error("insufficient margin for account {account_id}: requested {requested}, free {free}")]
    InsufficientMargin {
        account_id: String,
        requested: String,
        free: String,
    },

    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Recoverable no-op: the Event Store swallows this, callers should rarely see it directly.
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotency(String),

    #[error("transaction conflict on position {0}, retries exhausted")]
    TransactionConflict(String),

    #[error("operation {operation_id} timed out after {elapsed_ms}ms")]
    Timeout {
        operation_id: String,
        elapsed_ms: u64,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::InsufficientMargin { .. } => "InsufficientMargin",
            EngineError::PositionNotFound(_) => "PositionNotFound",
            EngineError::AccountNotFound(_) => "PositionNotFound",
            EngineError::DuplicateIdempotency(_) => "DuplicateIdempotency",
            EngineError::TransactionConflict(_) => "TransactionConflict",
            EngineError::Timeout { .. } => "Timeout",
            EngineError::PersistenceFailure(_) => "PersistenceFailure",
            EngineError::IntegrityViolation(_) => "IntegrityViolation",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Whether the whole transactional operation should be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionConflict(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                EngineError::TransactionConflict(e.to_string())
            }
            _ => EngineError::PersistenceFailure(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineError::InsufficientMargin { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::PositionNotFound(_) | EngineError::AccountNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::DuplicateIdempotency(_) => StatusCode::OK,
            EngineError::TransactionConflict(_) => StatusCode::CONFLICT,
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::IntegrityViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Cancelled(_) => StatusCode::BAD_REQUEST,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
