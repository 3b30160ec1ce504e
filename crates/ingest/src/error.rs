//! Error types for gateway event ingestion

use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The envelope or its `data.object` could not be decoded into a known shape.
    /// Usually an API version mismatch on the gateway side.
    #[error("Failed to decode webhook payload: {0}")]
    Decode(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Unsupported object for event {event_type}: {detail}")]
    UnsupportedObject { event_type: String, detail: String },

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    /// A related object the event cannot be normalized without is absent.
    #[error("Missing related object: {0}")]
    MissingRelated(String),

    #[error("Downstream sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event queue is full")]
    QueueSaturated,

    #[error("Event queue is closed")]
    QueueClosed,
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Decode(err.to_string())
    }
}

impl From<stripe::StripeError> for IngestError {
    fn from(err: stripe::StripeError) -> Self {
        IngestError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Sink(err.to_string())
    }
}
