//! Stripe webhook intake
//!
//! The request path only verifies, decodes and enqueues. Enrichment and sink
//! calls run on the keyed worker pool after the gateway has been answered.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{IngestError, IngestResult};
use crate::gateway::{WebhookEnvelope, WebhookEvent};
use crate::processor::EventProcessor;
use crate::queue::{KeyedWorkerPool, PoolConfig};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify a `t=<timestamp>,v1=<hex hmac>` signature header against the raw payload
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> IngestResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        IngestError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(IngestError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(IngestError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| IngestError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(IngestError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Produce a signature header for `payload`, as the gateway would
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> IngestResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| IngestError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Scheduled on the worker pool
    Queued { event_id: String, event_type: String },
    /// Event type has no processing path; logged and dropped
    Ignored { event_id: String, event_type: String },
}

/// Request-facing entry point
pub struct WebhookDispatcher {
    webhook_secret: Option<String>,
    pool: KeyedWorkerPool<WebhookEnvelope>,
}

impl WebhookDispatcher {
    /// Start the worker pool feeding `processor`. Must run inside a Tokio runtime.
    pub fn new(
        processor: Arc<EventProcessor>,
        webhook_secret: Option<String>,
        pool_config: PoolConfig,
    ) -> Self {
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
        }

        let pool = KeyedWorkerPool::spawn(pool_config, move |envelope: WebhookEnvelope| {
            let processor = processor.clone();
            async move { processor.run(envelope).await }
        });

        Self {
            webhook_secret,
            pool,
        }
    }

    /// Verify, decode and schedule one delivery. Returns as soon as the event
    /// is queued; processing results only show up in the logs.
    pub fn dispatch(&self, payload: &str, signature: Option<&str>) -> IngestResult<DispatchOutcome> {
        if let Some(secret) = &self.webhook_secret {
            let header = signature.ok_or_else(|| {
                tracing::warn!("Webhook delivered without signature header");
                IngestError::WebhookSignatureInvalid
            })?;
            verify_signature(payload, header, secret, OffsetDateTime::now_utc().unix_timestamp())?;
        }

        let envelope = WebhookEnvelope::decode(payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to decode webhook payload");
            e
        })?;

        let event_id = envelope.id.clone();
        let event_type = envelope.event_type.clone();

        if envelope.event == WebhookEvent::Unhandled {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Received unhandled Stripe event type - no handler configured"
            );
            return Ok(DispatchOutcome::Ignored {
                event_id,
                event_type,
            });
        }

        let key = envelope.ordering_key();
        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            ordering_key = %key,
            "Received Stripe webhook"
        );
        self.pool.submit(&key, envelope)?;

        Ok(DispatchOutcome::Queued {
            event_id,
            event_type,
        })
    }

    /// Stop accepting events and wait for queued ones to finish
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
