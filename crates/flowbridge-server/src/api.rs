//! Shared API error type for the flowbridge server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use flowbridge_crypto::CryptoError;
use flowbridge_store::StoreError;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    /// The envelope could not be decrypted. Answered with 421 so the
    /// messaging platform re-fetches the public key.
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("server configuration error: {0}")]
    Configuration(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Authentication(detail) => {
                tracing::warn!(detail = %detail, "rejecting undecryptable flow request");
                (
                    StatusCode::MISDIRECTED_REQUEST,
                    "failed to decrypt request".to_string(),
                )
            }
            ApiError::Configuration(detail) => {
                tracing::error!(detail = %detail, "flow endpoint misconfigured");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server configuration error".to_string(),
                )
            }
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Authentication(detail) => ApiError::Authentication(detail),
            CryptoError::InvalidPrivateKey(detail) => ApiError::Configuration(detail),
            CryptoError::Serialization(e) => {
                ApiError::InternalServerError(format!("failed to encode response: {}", e))
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidPhone(phone) => {
                ApiError::BadRequest(format!("invalid phone number: {}", phone))
            }
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}
