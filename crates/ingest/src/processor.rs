//! Event processing
//!
//! One closed match over the handled event types. Each arm enriches the
//! gateway object, applies the business rules for that type and hands the
//! result to the sinks. Business-rule skips are outcomes, not errors.

use std::sync::Arc;

use serde::Serialize;

use crate::config::IngestConfig;
use crate::enrich::Enricher;
use crate::error::IngestResult;
use crate::event::PaymentGatewayEvent;
use crate::fetcher::GatewayObjectFetcher;
use crate::gateway::{
    Charge, PaymentIntent, Payout, RefundPayload, Subscription, WebhookEnvelope, WebhookEvent,
};
use crate::guard::SubscriptionDecision;
use crate::payout::{PaymentGatewayDeposit, PayoutReconciler, PayoutReconciliation};
use crate::sink::Sinks;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    DonationCreated {
        transaction_id: Option<String>,
        recurring: bool,
    },
    Refunded {
        refund_id: String,
        transaction_id: Option<String>,
    },
    RecurringDonationCreated {
        subscription_id: String,
    },
    RecurringDonationClosed {
        subscription_id: String,
    },
    Deposited {
        deposited: usize,
        failed: usize,
        deposit: PaymentGatewayDeposit,
    },
    Skipped {
        reason: String,
    },
    Unhandled,
}

impl ProcessOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        ProcessOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct EventProcessor {
    enricher: Enricher,
    reconciler: PayoutReconciler,
    sinks: Sinks,
}

impl EventProcessor {
    pub fn new(
        fetcher: Arc<dyn GatewayObjectFetcher>,
        config: Arc<IngestConfig>,
        sinks: Sinks,
    ) -> Self {
        let enricher = Enricher::new(fetcher, config);
        Self {
            reconciler: PayoutReconciler::new(enricher.clone(), sinks.donations.clone()),
            enricher,
            sinks,
        }
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    /// Process one decoded webhook
    pub async fn process(&self, envelope: &WebhookEnvelope) -> IngestResult<ProcessOutcome> {
        match &envelope.event {
            WebhookEvent::ChargeSucceeded(charge) | WebhookEvent::ChargeFailed(charge) => {
                self.handle_charge(charge).await
            }
            WebhookEvent::PaymentIntentSucceeded(intent)
            | WebhookEvent::PaymentIntentFailed(intent) => self.handle_payment_intent(intent).await,
            WebhookEvent::ChargeRefunded(payload) => self.handle_refund(payload).await,
            WebhookEvent::SubscriptionCreated(subscription) => {
                self.handle_subscription_created(subscription).await
            }
            WebhookEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription).await
            }
            WebhookEvent::PayoutPaid(payout) => self.handle_payout(payout).await,
            WebhookEvent::Unhandled => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(ProcessOutcome::Unhandled)
            }
        }
    }

    /// Process and log. Errors stop here; nothing reaches other events.
    pub async fn run(&self, envelope: WebhookEnvelope) {
        let ordering_key = envelope.ordering_key();
        match self.process(&envelope).await {
            Ok(ProcessOutcome::Skipped { reason }) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    reason = %reason,
                    "Event skipped"
                );
            }
            Ok(outcome) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    outcome = ?outcome,
                    "Event processed"
                );
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    ordering_key = %ordering_key,
                    error = %e,
                    "Event processing failed, event dropped"
                );
            }
        }
    }

    async fn handle_charge(&self, charge: &Charge) -> IngestResult<ProcessOutcome> {
        // The intent's own event reports the same money movement
        if let Some(intent_id) = charge.payment_intent_id() {
            return Ok(ProcessOutcome::skipped(format!(
                "charge {} belongs to payment intent {}",
                charge.id, intent_id
            )));
        }

        let event = self.enricher.charge_event(charge, None).await?;
        self.create_donation(event).await
    }

    async fn handle_payment_intent(&self, intent: &PaymentIntent) -> IngestResult<ProcessOutcome> {
        let event = self.enricher.payment_intent_event(&intent.id).await?;
        self.create_donation(event).await
    }

    async fn create_donation(&self, mut event: PaymentGatewayEvent) -> IngestResult<ProcessOutcome> {
        self.sinks.accounts.process_account(&mut event).await?;

        let recurring = event.is_transaction_recurring();
        if recurring {
            // First charge of a live subscription creates its recurring donation
            self.sinks.donations.process_subscription(&mut event).await?;
        }

        self.sinks.donations.create_donation(&event).await?;
        Ok(ProcessOutcome::DonationCreated {
            transaction_id: event.donation.transaction_id.clone(),
            recurring,
        })
    }

    async fn handle_refund(&self, payload: &RefundPayload) -> IngestResult<ProcessOutcome> {
        let Some(refund) = payload.refund() else {
            return Ok(ProcessOutcome::skipped("refunded charge carries no refund"));
        };

        // Stripe has delivered both shapes under charge.refunded; keep track of which one we see
        let shape = match payload {
            RefundPayload::Charge(_) => "charge",
            RefundPayload::Refund(_) => "refund",
        };
        tracing::debug!(refund_id = %refund.id, payload_shape = shape, "Normalizing refund");

        let event = PaymentGatewayEvent::from_refund(self.enricher.config().clone(), &refund);
        self.sinks.donations.refund_donation(&event).await?;
        Ok(ProcessOutcome::Refunded {
            refund_id: refund.id,
            transaction_id: event.donation.transaction_id,
        })
    }

    async fn handle_subscription_created(
        &self,
        subscription: &Subscription,
    ) -> IngestResult<ProcessOutcome> {
        let decision = SubscriptionDecision::evaluate(subscription);
        if !decision.creates() {
            return Ok(ProcessOutcome::skipped(format!(
                "{}: {}",
                subscription.id,
                decision.reason()
            )));
        }

        let mut event = self.enricher.subscription_event(subscription).await?;
        self.sinks.accounts.process_account(&mut event).await?;
        self.sinks.donations.process_subscription(&mut event).await?;
        Ok(ProcessOutcome::RecurringDonationCreated {
            subscription_id: subscription.id.clone(),
        })
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &Subscription,
    ) -> IngestResult<ProcessOutcome> {
        let event = self.enricher.subscription_event(subscription).await?;
        self.sinks.donations.close_recurring_donation(&event).await?;
        Ok(ProcessOutcome::RecurringDonationClosed {
            subscription_id: subscription.id.clone(),
        })
    }

    async fn handle_payout(&self, payout: &Payout) -> IngestResult<ProcessOutcome> {
        let reconciliation = self.deposit_payout(payout).await?;
        Ok(ProcessOutcome::Deposited {
            deposited: reconciliation.events.len(),
            failed: reconciliation.failed,
            deposit: reconciliation.deposit,
        })
    }

    /// Reconcile a payout, one deposit notification per charge
    pub async fn deposit_payout(&self, payout: &Payout) -> IngestResult<PayoutReconciliation> {
        self.reconciler.reconcile(payout).await
    }
}
