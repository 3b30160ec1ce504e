//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use donorbridge_ingest::IngestError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Payload is not an event shape we understand
    #[error("Undecodable webhook: {0}")]
    Undecodable(String),

    /// Workers cannot take the event right now; the gateway will redeliver
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            IngestError::Decode(_) | IngestError::UnsupportedObject { .. } => {
                ApiError::Undecodable(err.to_string())
            }
            IngestError::QueueSaturated | IngestError::QueueClosed => {
                ApiError::Unavailable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Bodies stay empty: the only client is the payment gateway
        let status = match &self {
            ApiError::InvalidSignature => StatusCode::BAD_REQUEST,
            ApiError::Undecodable(detail) => {
                tracing::error!(detail = %detail, "Rejecting undecodable webhook");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Unavailable(detail) => {
                tracing::warn!(detail = %detail, "Rejecting webhook, workers unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        status.into_response()
    }
}
