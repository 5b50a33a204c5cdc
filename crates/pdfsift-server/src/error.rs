use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pdfsift_core::CoreError;
use tracing::{error, warn};

/// Errors returned by HTTP handlers, rendered as `{"detail": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    LlmFailed(String),

    #[error("{0}")]
    LlmUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::LlmFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::LlmUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidUpload(msg) => ApiError::BadRequest(msg),
            CoreError::Pdf(msg) => ApiError::BadRequest(format!("Error processing PDF: {msg}")),
            CoreError::Llm(msg) => ApiError::LlmFailed(format!("Summary generation failed: {msg}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("background task failed: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        let detail = match &self {
            // Internal details stay in the log
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let cases = [
            (CoreError::InvalidUpload("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::Pdf("bad xref".into()), StatusCode::BAD_REQUEST),
            (CoreError::Llm("timeout".into()), StatusCode::BAD_GATEWAY),
            (CoreError::Config("oops".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (core, status) in cases {
            assert_eq!(ApiError::from(core).status(), status);
        }
    }

    #[tokio::test]
    async fn test_detail_body() {
        let response = ApiError::NotFound("Document not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "Document not found");
    }

    #[tokio::test]
    async fn test_internal_detail_hidden() {
        let response = ApiError::Internal("disk I/O error at /secret".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "Internal server error");
    }
}
