// Ingest crate clippy configuration
#![allow(clippy::result_large_err)] // IngestError carries event type context
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DonorBridge Ingest
//!
//! Turns Stripe webhook events into CRM-agnostic donation records.
//!
//! ## Features
//!
//! - **Webhook intake**: Signature verification, envelope decoding, keyed scheduling
//! - **Enrichment**: Fetches customers, invoices, balance transactions and payment intents
//! - **Normalization**: Account, contact, donation and recurring donation records
//! - **Metadata resolution**: Tiered, case-insensitive lookup of donor data and CRM ids
//! - **Subscription guard**: Prevents duplicate recurring donations
//! - **Payout reconciliation**: One deposit record per charge in a payout
//! - **Replay**: Backfill deposits for a window of payouts

pub mod client;
pub mod config;
pub mod enrich;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod gateway;
pub mod guard;
pub mod metadata;
pub mod model;
pub mod payout;
pub mod processor;
pub mod queue;
pub mod replay;
pub mod sink;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::IngestConfig;

// Enrichment
pub use enrich::Enricher;

// Error
pub use error::{IngestError, IngestResult};

// Event
pub use event::{PaymentGatewayEvent, RelatedObjects, GATEWAY_NAME};

// Fetcher
pub use fetcher::{ArrivalWindow, GatewayObjectFetcher, PAGE_LIMIT};

// Gateway objects
pub use gateway::{GatewayObject, RefundPayload, WebhookEnvelope, WebhookEvent};

// Guard
pub use guard::SubscriptionDecision;

// Metadata
pub use metadata::{Metadata, MetadataKeys, MetadataTier, MetadataTiers};

// Model
pub use model::{
    CrmAccount, CrmAddress, CrmContact, CrmDonation, CrmRecurringDonation, DonationStatus,
    Frequency, PreferredPhone,
};

// Payout
pub use payout::{FundLedger, PaymentGatewayDeposit, PayoutReconciler, PayoutReconciliation};

// Processor
pub use processor::{EventProcessor, ProcessOutcome};

// Queue
pub use queue::{KeyedWorkerPool, PoolConfig};

// Replay
pub use replay::{replay_payouts, ReplaySummary};

// Sinks
pub use sink::{AccountSink, DonationSink, HttpSink, LoggingSink, Sinks};

// Webhooks
pub use webhooks::{verify_signature, DispatchOutcome, WebhookDispatcher, SIGNATURE_HEADER};

use std::sync::Arc;

/// Everything needed to ingest webhooks for one organization
pub struct IngestService {
    pub stripe: StripeClient,
    pub config: Arc<IngestConfig>,
    pub processor: Arc<EventProcessor>,
}

impl IngestService {
    /// Create the service from environment variables
    pub fn from_env() -> IngestResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = Arc::new(IngestConfig::from_env());
        let sinks = Sinks::from_env()?;
        Ok(Self::new(stripe, config, sinks))
    }

    pub fn new(stripe: StripeClient, config: Arc<IngestConfig>, sinks: Sinks) -> Self {
        let processor = Arc::new(EventProcessor::new(
            Arc::new(stripe.clone()),
            config.clone(),
            sinks,
        ));
        Self {
            stripe,
            config,
            processor,
        }
    }

    /// Start the webhook dispatcher on the current runtime
    pub fn dispatcher(&self, pool_config: PoolConfig) -> WebhookDispatcher {
        WebhookDispatcher::new(
            self.processor.clone(),
            self.stripe.config().webhook_secret.clone(),
            pool_config,
        )
    }
}
