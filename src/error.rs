use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::AdjustmentResponse;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Request timestamp outside of allowed window: {0}")]
    StaleTimestamp(String),

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Session invalid")]
    SessionInvalid,

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("External API error: {0}")]
    ExternalAPI(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Balance commit contention for {0}")]
    CommitContention(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::StaleTimestamp(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidSignature
            | AppError::OriginNotAllowed(_)
            | AppError::SessionInvalid
            | AppError::AuthError(_) => StatusCode::FORBIDDEN,
            AppError::PriceUnavailable(_)
            | AppError::ExternalAPI(_)
            | AppError::Timeout(_)
            | AppError::CommitContention(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message placed in `errormsg`. Infrastructure details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::InvalidSignature => "Invalid signature".to_string(),
            AppError::StaleTimestamp(_) => "Request expired".to_string(),
            AppError::OriginNotAllowed(_) => "Origin not allowed".to_string(),
            AppError::SessionInvalid => "Session invalid".to_string(),
            AppError::AuthError(msg) => msg.clone(),
            AppError::PriceUnavailable(_) | AppError::ExternalAPI(_) | AppError::Timeout(_) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::CommitContention(_) => "Balance busy, transaction not applied".to_string(),
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "Internal error".to_string()
            }
        }
    }

    pub fn is_security(&self) -> bool {
        matches!(
            self,
            AppError::InvalidSignature
                | AppError::StaleTimestamp(_)
                | AppError::OriginNotAllowed(_)
                | AppError::SessionInvalid
        )
    }

    /// Wire body for this error, echoing whatever balance could be determined.
    pub fn to_body(&self, balance: Option<String>) -> AdjustmentResponse {
        AdjustmentResponse::failure(balance, self.public_message())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(self.to_body(None))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
