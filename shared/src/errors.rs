use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Stable error codes following the platform-wide pattern E{service}{sequence}.
///
/// Ranges:
/// - E0xxx: shared/infrastructure errors
/// - E3xxx: matchmaking-core errors (collision, mission, match, cooldown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    BadRequest,

    // Matching core (E3xxx)
    InvalidCoordinates,
    PairLockHeld,
    CooldownActive,
    MissionNotFound,
    MissionAlreadyTerminal,
    NoEligibleCircle,
    IntegrityViolation,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Unauthorized => "E0004",
            Self::Forbidden => "E0005",
            Self::ServiceUnavailable => "E0006",
            Self::BadRequest => "E0007",

            Self::InvalidCoordinates => "E3001",
            Self::PairLockHeld => "E3002",
            Self::CooldownActive => "E3003",
            Self::MissionNotFound => "E3004",
            Self::MissionAlreadyTerminal => "E3005",
            Self::NoEligibleCircle => "E3006",
            Self::IntegrityViolation => "E3007",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError | Self::ServiceUnavailable | Self::IntegrityViolation => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ValidationError | Self::BadRequest | Self::InvalidCoordinates => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound | Self::MissionNotFound | Self::NoEligibleCircle => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::PairLockHeld | Self::CooldownActive | Self::MissionAlreadyTerminal => {
                StatusCode::CONFLICT
            }
        }
    }
}

/// Error taxonomy for the matchmaking core.
///
/// `Validation` is rejected synchronously and never emitted as an event.
/// `Transient` is retried locally and only surfaced once the retry budget is
/// exhausted. `Conflict` represents a logical no-op (lock held, cooldown
/// active, mission already terminal) rather than a failure. `Integrity`
/// indicates a code defect and is always logged with full context.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("logical conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            CoreError::Known { code, message, details } => {
                let status = code.status_code();
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (status, resp)
            }
            CoreError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new(ErrorCode::ValidationError.code(), msg),
            ),
            CoreError::Transient(msg) => {
                tracing::warn!(error = %msg, "transient infrastructure error surfaced to caller");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiErrorResponse::new(ErrorCode::ServiceUnavailable.code(), msg),
                )
            }
            CoreError::Conflict(msg) => (
                StatusCode::CONFLICT,
                ApiErrorResponse::new(ErrorCode::PairLockHeld.code(), msg),
            ),
            CoreError::Integrity(msg) => {
                tracing::error!(error = %msg, "integrity violation");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new(ErrorCode::IntegrityViolation.code(), msg),
                )
            }
            CoreError::Database(err) => {
                tracing::error!(error = %err, "database error");
                match err {
                    diesel::result::Error::NotFound => (
                        StatusCode::NOT_FOUND,
                        ApiErrorResponse::new(ErrorCode::NotFound.code(), "resource not found"),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ApiErrorResponse::new(ErrorCode::InternalError.code(), "database error"),
                    ),
                }
            }
            CoreError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new(ErrorCode::InternalError.code(), "internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_error_carries_its_own_status_code() {
        let err = CoreError::new(ErrorCode::CooldownActive, "pair is on cooldown");
        match &err {
            CoreError::Known { code, .. } => assert_eq!(code.status_code(), StatusCode::CONFLICT),
            _ => panic!("expected Known variant"),
        }
    }

    #[test]
    fn database_not_found_maps_to_404() {
        let err: CoreError = diesel::result::Error::NotFound.into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
