use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("request timeout")]
    Timeout,
    #[error("target rejected: {0}")]
    SsrfRejected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::Timeout => "TIMEOUT",
            AppError::SsrfRejected(_) => "SSRF_PROTECTION",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) | AppError::SsrfRejected(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Timeout => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let msg = match &self {
            AppError::Database(err) => {
                tracing::error!(error = ?err, "database operation failed");
                "An unexpected error occurred".to_owned()
            }
            AppError::Internal(message) => {
                tracing::error!(message = %message, "internal error");
                "An unexpected error occurred".to_owned()
            }
            AppError::Validation(message)
            | AppError::Unauthorized(message)
            | AppError::Forbidden(message)
            | AppError::NotFound(message)
            | AppError::Conflict(message)
            | AppError::PayloadTooLarge(message)
            | AppError::SsrfRejected(message) => {
                tracing::warn!(code = self.code(), message = %message, "request rejected");
                message.to_owned()
            }
            AppError::Timeout => {
                tracing::warn!(code = self.code(), "request timed out");
                "Request timeout".to_owned()
            }
        };

        let mut response = (
            self.status(),
            Json(ErrorBody {
                error: ErrorDetail {
                    code: self.code(),
                    message: msg,
                },
            }),
        )
            .into_response();

        if matches!(self, AppError::PayloadTooLarge(_)) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn render(err: AppError) -> (StatusCode, serde_json::Value, Response) {
        let response = err.into_response();
        let status = response.status();
        let (parts, body) = response.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap();
        (status, value, Response::from_parts(parts, axum::body::Body::empty()))
    }

    #[tokio::test]
    async fn ssrf_rejection_is_a_bad_request_with_its_own_code() {
        let (status, body, _) = render(AppError::SsrfRejected("nope".into())).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "SSRF_PROTECTION");
        assert_eq!(body["error"]["message"], "nope");
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() {
        let (status, body, _) =
            render(AppError::internal("pool exhausted at 10.0.0.4")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "An unexpected error occurred");
    }

    #[tokio::test]
    async fn payload_too_large_closes_the_connection() {
        let (status, body, response) =
            render(AppError::PayloadTooLarge("too big".into())).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }
}
