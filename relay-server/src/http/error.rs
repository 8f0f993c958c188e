use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use shared::models::ValidationError;
use thiserror::Error;
use tracing::error;

use super::problem::ProblemDetails;
use crate::services::RelayError;

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
        )
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound => Self::not_found("conversation not found"),
            RelayError::Validation(validation) => Self::from(validation),
            RelayError::Unavailable(reason) => Self::service_unavailable(reason),
            RelayError::Publish(_)
            | RelayError::Replay(_)
            | RelayError::Generation { .. }
            | RelayError::Transport => {
                error!(error = %err, "request failed");
                Self::internal_server_error("the request could not be completed")
            }
        }
    }
}

impl From<http::Error> for ApiError {
    fn from(err: http::Error) -> Self {
        error!(error = %err, "failed to build response");
        Self::internal_server_error("the request could not be completed")
    }
}

/// Rejection for malformed JSON bodies, shaped like every other error.
impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        Self::bad_request("invalid request body").with_details(json!({
            "reason": rejection.body_text()
        }))
    }
}

impl From<axum::extract::rejection::QueryRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::QueryRejection) -> Self {
        Self::bad_request("invalid query parameters").with_details(json!({
            "reason": rejection.body_text()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::LogStoreError;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("missing conversation")
            .with_details(json!({ "id": "abc" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value = serde_json::from_slice(&bytes).expect("problem json");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["status"], 404);
        assert_eq!(json["message"], "missing conversation");
        assert_eq!(json["details"]["id"], "abc");
    }

    #[test]
    fn relay_errors_map_to_status_codes() {
        assert_eq!(ApiError::from(RelayError::NotFound).status, StatusCode::NOT_FOUND);

        let validation = ApiError::from(RelayError::Validation(ValidationError::EmptyContent));
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);
        assert_eq!(validation.code, "validation_failed");

        let unavailable = ApiError::from(RelayError::Unavailable("no provider"));
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn storage_failures_do_not_leak_details() {
        let err = ApiError::from(RelayError::Publish(LogStoreError::Publish(
            "nats: stream CONVERSATIONS full".into(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "internal_error");
        assert!(!err.message.contains("CONVERSATIONS"));
    }
}
