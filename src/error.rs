use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// One offending request field and why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        FieldError {
            field,
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid request parameters: {0:?}")]
    Validation(Vec<FieldError>),

    #[error("database query failed: {0}")]
    Store(#[from] diesel::result::Error),

    #[error("database connection unavailable: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("malformed aggregate value: {0}")]
    Aggregate(String),

    #[error("query worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("rate limit exceeded")]
    RateLimited,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(_) | ApiError::Pool(_) | ApiError::Aggregate(_) | ApiError::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Validation(errors) => serde_json::json!({ "detail": errors }),
            other => serde_json::json!({ "detail": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
