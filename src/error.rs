use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::{dao::storage::StorageError, state::control::ControlError};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The node refused the intent; nothing changed.
    #[error(transparent)]
    Policy(#[from] ControlError),
    /// The node task is gone and cannot answer.
    #[error("sync node is not running")]
    NodeStopped,
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Policy(ControlError::InvalidInput(message)) => AppError::BadRequest(message),
            ServiceError::Policy(policy) => AppError::Conflict(policy.to_string()),
            ServiceError::NodeStopped => AppError::ServiceUnavailable("sync node stopped".into()),
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_errors_map_to_conflict_except_bad_input() {
        let conflict: AppError = ServiceError::Policy(ControlError::NotInControl {
            holder: Some("peer".into()),
        })
        .into();
        assert!(matches!(conflict, AppError::Conflict(_)));

        let bad: AppError =
            ServiceError::Policy(ControlError::InvalidInput("delta".into())).into();
        assert!(matches!(bad, AppError::BadRequest(message) if message == "delta"));

        let stopped: AppError = ServiceError::NodeStopped.into();
        assert_eq!(
            stopped.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
