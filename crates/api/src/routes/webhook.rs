//! Stripe webhook endpoint
//!
//! Answers as soon as the event is verified, decoded and queued. Processing
//! happens on the ingest worker pool, so a 200 here only means "accepted".

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use donorbridge_ingest::{DispatchOutcome, SIGNATURE_HEADER};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.dispatcher.dispatch(&body, signature)? {
        DispatchOutcome::Queued { event_id, .. } => {
            tracing::debug!(event_id = %event_id, "Webhook accepted");
        }
        DispatchOutcome::Ignored { event_id, event_type } => {
            tracing::debug!(event_id = %event_id, event_type = %event_type, "Webhook acknowledged without processing");
        }
    }

    Ok(StatusCode::OK)
}
