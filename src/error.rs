use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request timestamp outside freshness window")]
    AuthExpired,

    #[error("Invalid signature: {0}")]
    AuthInvalidSignature(String),

    #[error("Invalid, expired, or already-used nonce")]
    AuthInvalidNonce,

    #[error("Rate limit exceeded for {counter}: {current}/{limit} today")]
    RateLimited {
        counter: &'static str,
        limit: u64,
        current: u64,
    },

    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthExpired
            | ApiError::AuthInvalidSignature(_)
            | ApiError::AuthInvalidNonce => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs, not on the wire
        let body = match &self {
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                json!({ "error": "Internal server error" })
            }
            ApiError::RateLimited {
                counter,
                limit,
                current,
            } => json!({
                "error": self.to_string(),
                "counter": counter,
                "limit": limit,
                "current": current,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
