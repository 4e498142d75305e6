//! Error types for the demo server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use leaselock_core::{LockError, StoreError};
use serde::Serialize;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Stock counter {0} has not been seeded")]
    StockNotSeeded(String),

    #[error("Stock counter holds a non-numeric value: {0}")]
    CorruptStock(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            code: &'static str,
        }

        let (status, code) = match &self {
            ServerError::Lock(LockError::AcquireTimeout { .. }) => {
                (StatusCode::LOCKED, "LOCK_TIMEOUT")
            }
            ServerError::Lock(LockError::LockLost { .. }) => (StatusCode::CONFLICT, "LOCK_LOST"),
            ServerError::Lock(LockError::Store(_)) | ServerError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
            }
            ServerError::Lock(LockError::InvalidArgument(_)) | ServerError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
            }
            ServerError::StockNotSeeded(_) => (StatusCode::CONFLICT, "STOCK_NOT_SEEDED"),
            ServerError::CorruptStock(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CORRUPT_STOCK"),
        };

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (
                ServerError::Lock(LockError::LockLost {
                    key: "k".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ServerError::Store(StoreError::Unavailable("down".to_string())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServerError::InvalidRequest("negative".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
