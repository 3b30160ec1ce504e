//! Fetch orchestration
//!
//! Decides which related objects a primary gateway object needs, fetches them
//! one at a time, and builds the [`PaymentGatewayEvent`]. Missing references
//! are fine and leave the related object out; a failed lookup aborts the event.

use std::sync::Arc;

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::event::{PaymentGatewayEvent, RelatedObjects};
use crate::fetcher::GatewayObjectFetcher;
use crate::gateway::{BalanceTransaction, Charge, Customer, PaymentIntent, Subscription};

#[derive(Clone)]
pub struct Enricher {
    fetcher: Arc<dyn GatewayObjectFetcher>,
    config: Arc<IngestConfig>,
}

impl Enricher {
    pub fn new(fetcher: Arc<dyn GatewayObjectFetcher>, config: Arc<IngestConfig>) -> Self {
        Self { fetcher, config }
    }

    pub fn fetcher(&self) -> &Arc<dyn GatewayObjectFetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &Arc<IngestConfig> {
        &self.config
    }

    /// Normalize a charge. `balance_transaction` is passed by the payout path,
    /// which already holds it; otherwise it is fetched when the charge has one.
    pub async fn charge_event(
        &self,
        charge: &Charge,
        balance_transaction: Option<BalanceTransaction>,
    ) -> IngestResult<PaymentGatewayEvent> {
        let customer = self.optional_customer(charge.customer_id()).await?;

        let invoice = match charge.invoice_id() {
            Some(id) => Some(self.fetcher.invoice(id).await?),
            None => None,
        };

        let balance_transaction = match (balance_transaction, charge.balance_transaction_id()) {
            (Some(bt), _) => Some(bt),
            (None, Some(id)) => Some(self.fetcher.balance_transaction(id).await?),
            (None, None) => {
                tracing::debug!(charge_id = %charge.id, "Charge not settled yet, no balance transaction");
                None
            }
        };

        let related = RelatedObjects {
            customer,
            invoice,
            balance_transaction,
        };
        Ok(PaymentGatewayEvent::from_charge(self.config.clone(), charge, &related))
    }

    /// Normalize a payment intent. Webhook payloads sometimes omit the
    /// customer or metadata, so the intent is always re-fetched in full.
    pub async fn payment_intent_event(&self, intent_id: &str) -> IngestResult<PaymentGatewayEvent> {
        let intent = self.fetcher.payment_intent(intent_id).await?;
        self.payment_intent_event_from(&intent, None).await
    }

    /// Normalize an already-fetched payment intent
    pub async fn payment_intent_event_from(
        &self,
        intent: &PaymentIntent,
        balance_transaction: Option<BalanceTransaction>,
    ) -> IngestResult<PaymentGatewayEvent> {
        let customer = self.optional_customer(intent.customer_id()).await?;

        let invoice = match intent.invoice_id() {
            Some(id) => Some(self.fetcher.invoice(id).await?),
            None => None,
        };

        let balance_transaction = match balance_transaction {
            Some(bt) => Some(bt),
            None => self.intent_balance_transaction(intent).await?,
        };

        let related = RelatedObjects {
            customer,
            invoice,
            balance_transaction,
        };
        Ok(PaymentGatewayEvent::from_payment_intent(self.config.clone(), intent, &related))
    }

    /// Normalize a subscription. The customer is required here: without it
    /// there is nobody to attach the recurring donation to.
    pub async fn subscription_event(
        &self,
        subscription: &Subscription,
    ) -> IngestResult<PaymentGatewayEvent> {
        let customer_id = subscription.customer_id().ok_or_else(|| {
            IngestError::MissingRelated(format!("customer for subscription {}", subscription.id))
        })?;
        let customer = self.fetcher.customer(customer_id).await?;
        Ok(PaymentGatewayEvent::from_subscription(
            self.config.clone(),
            subscription,
            &customer,
        ))
    }

    async fn optional_customer(&self, customer_id: Option<&str>) -> IngestResult<Option<Customer>> {
        match customer_id {
            Some(id) => Ok(Some(self.fetcher.customer(id).await?)),
            None => Ok(None),
        }
    }

    /// Settlement data is only unambiguous when the intent has a single charge
    async fn intent_balance_transaction(
        &self,
        intent: &PaymentIntent,
    ) -> IngestResult<Option<BalanceTransaction>> {
        let charges = intent.charge_list();
        let [charge] = charges.as_slice() else {
            return Ok(None);
        };
        match charge.balance_transaction.as_ref() {
            Some(reference) => match reference.as_object() {
                Some(bt) => Ok(Some(bt.clone())),
                None => match charge.balance_transaction_id() {
                    Some(id) => Ok(Some(self.fetcher.balance_transaction(id).await?)),
                    None => Ok(None),
                },
            },
            None => Ok(None),
        }
    }
}
