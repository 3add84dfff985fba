//! Error types for lifelog-cc
//!
//! `DedupError` is the pipeline taxonomy; `ErrorInfo` is its serializable,
//! caller-facing form; `ApiError` maps both onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum DedupError {
    /// Malformed day/priority input; rejected immediately, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// No conversation records exist for the requested day
    #[error("Not found: {0}")]
    NotFound(String),

    /// Embedding provider failure; retryable within the retry budget
    #[error("Embedding provider error: {0}")]
    Provider(String),

    /// Persistence failure; retryable, the unit keeps its prior status
    #[error("Storage error: {0}")]
    Storage(String),

    /// Caller-facing only; the underlying computation keeps running
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Malformed similarity data; degraded to an all-unique projection
    #[error("Clustering error: {0}")]
    Clustering(String),
}

/// Result alias for pipeline operations
pub type DedupResult<T> = Result<T, DedupError>;

impl DedupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::Validation(_) => ErrorKind::Validation,
            DedupError::NotFound(_) => ErrorKind::NotFound,
            DedupError::Provider(_) => ErrorKind::Provider,
            DedupError::Storage(_) => ErrorKind::Storage,
            DedupError::Timeout(_) => ErrorKind::Timeout,
            DedupError::Clustering(_) => ErrorKind::Clustering,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<sqlx::Error> for DedupError {
    fn from(err: sqlx::Error) -> Self {
        DedupError::Storage(err.to_string())
    }
}

impl From<lifelog_common::Error> for DedupError {
    fn from(err: lifelog_common::Error) -> Self {
        match err {
            lifelog_common::Error::InvalidInput(msg) | lifelog_common::Error::Config(msg) => {
                DedupError::Validation(msg)
            }
            lifelog_common::Error::NotFound(msg) => DedupError::NotFound(msg),
            other => DedupError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DedupError {
    fn from(err: serde_json::Error) -> Self {
        DedupError::Storage(format!("Serialization failed: {}", err))
    }
}

/// Error category as exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Provider,
    Storage,
    Timeout,
    Clustering,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Provider | ErrorKind::Storage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Provider => "provider",
            ErrorKind::Storage => "storage",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Clustering => "clustering",
        }
    }
}

/// Serializable error summary carried in results and progress frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<DedupError> for ApiError {
    fn from(err: DedupError) -> Self {
        match err {
            DedupError::Validation(msg) => ApiError::BadRequest(msg),
            DedupError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(DedupError::Provider("down".into()).is_retryable());
        assert!(DedupError::Storage("locked".into()).is_retryable());
        assert!(!DedupError::Validation("bad".into()).is_retryable());
        assert!(!DedupError::Timeout(30_000).is_retryable());
        assert!(!DedupError::Clustering("nan".into()).is_retryable());
    }

    #[test]
    fn test_api_mapping() {
        assert!(matches!(
            ApiError::from(DedupError::Validation("x".into())),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(DedupError::NotFound("x".into())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(DedupError::Storage("x".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_error_info_serialization() {
        let info = DedupError::Provider("503".into()).info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "provider");
        assert_eq!(json["message"], "Embedding provider error: 503");
    }

    #[test]
    fn test_bad_request_status_code() {
        let response = ApiError::BadRequest("bad day".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
