//! API error type
//!
//! Every handler returns `ApiResult<T>`; failures render as a JSON body
//! with a stable `error_code` the frontend can switch on.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::ProfilerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self { status, error_code, message: message.into() }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_DATA", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error_code = self.error_code, message = %self.message, "api error");
        }
        let body = Json(json!({
            "status": "error",
            "error_code": self.error_code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<ProfilerError> for ApiError {
    fn from(err: ProfilerError) -> Self {
        match err {
            ProfilerError::BrokenQueryShape(message) => {
                Self::new(StatusCode::BAD_REQUEST, "BROKEN_QUERY_SHAPE", message)
            }
            ProfilerError::NoDatabase => Self::service_unavailable(err.to_string()),
            ProfilerError::Database(db_err) => {
                Self::internal_error(format!("database error: {}", db_err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_shape_maps_to_400_with_code() {
        let api: ApiError = ProfilerError::legacy_shape().into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.error_code, "BROKEN_QUERY_SHAPE");
        assert!(api.message.contains("<N items>"));
    }

    #[test]
    fn test_no_database_maps_to_503() {
        let api: ApiError = ProfilerError::NoDatabase.into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_constructor_status_codes() {
        assert_eq!(ApiError::unauthorized("x").status, StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::forbidden("x").status, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::rate_limited("x").status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ApiError::invalid_data("x").status, StatusCode::BAD_REQUEST);
    }
}
