//! Downstream CRM collaborators
//!
//! Sinks receive the fully populated record graph. Whatever ids they assign
//! are threaded back onto the event so later calls for the same event can
//! reference them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{IngestError, IngestResult};
use crate::event::PaymentGatewayEvent;

/// Account and contact upsert, keyed by resolved identity
#[async_trait]
pub trait AccountSink: Send + Sync {
    async fn process_account(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()>;
}

#[async_trait]
pub trait DonationSink: Send + Sync {
    async fn create_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()>;

    async fn refund_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()>;

    /// Create the recurring donation for the event's subscription if it does not exist
    async fn process_subscription(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()>;

    async fn close_recurring_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()>;

    async fn charge_deposited(&self, event: &PaymentGatewayEvent) -> IngestResult<()>;
}

/// Both collaborators, shared by every worker
#[derive(Clone)]
pub struct Sinks {
    pub accounts: Arc<dyn AccountSink>,
    pub donations: Arc<dyn DonationSink>,
}

impl Sinks {
    pub fn new(accounts: Arc<dyn AccountSink>, donations: Arc<dyn DonationSink>) -> Self {
        Self {
            accounts,
            donations,
        }
    }

    /// HTTP sink when `CRM_SINK_URL` is set, otherwise log-only
    pub fn from_env() -> IngestResult<Self> {
        match std::env::var("CRM_SINK_URL").ok().filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                tracing::info!(sink_url = %url, "Forwarding normalized events to CRM sink");
                let sink = Arc::new(HttpSink::new(url)?);
                Ok(Self::new(sink.clone(), sink))
            }
            None => {
                tracing::warn!("CRM_SINK_URL not set, normalized events will only be logged");
                let sink = Arc::new(LoggingSink);
                Ok(Self::new(sink.clone(), sink))
            }
        }
    }
}

/// Writes each call to the log and assigns nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl AccountSink for LoggingSink {
    async fn process_account(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            account_name = %event.donor_name(),
            customer_id = ?event.donation.customer_id,
            email = ?event.contact.email,
            phone = ?event.contact.phone(),
            can_email = event.contact.can_receive_email(),
            "process_account"
        );
        Ok(())
    }
}

#[async_trait]
impl DonationSink for LoggingSink {
    async fn create_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            transaction_id = ?event.donation.transaction_id,
            amount = ?event.donation.amount,
            status = ?event.donation.status,
            "create_donation"
        );
        Ok(())
    }

    async fn refund_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            transaction_id = ?event.donation.transaction_id,
            refund_id = ?event.donation.refund_id,
            "refund_donation"
        );
        Ok(())
    }

    async fn process_subscription(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            subscription_id = ?event.recurring_donation.subscription_id,
            amount = ?event.recurring_donation.amount,
            frequency = ?event.recurring_donation.frequency,
            "process_subscription"
        );
        Ok(())
    }

    async fn close_recurring_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            subscription_id = ?event.recurring_donation.subscription_id,
            "close_recurring_donation"
        );
        Ok(())
    }

    async fn charge_deposited(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        tracing::info!(
            transaction_id = ?event.donation.transaction_id,
            deposit_id = ?event.donation.deposit_id,
            net = ?event.donation.net_amount_in_dollars,
            "charge_deposited"
        );
        Ok(())
    }
}

/// Ids a sink endpoint may return
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssignedIds {
    account_id: Option<String>,
    contact_id: Option<String>,
    recurring_donation_id: Option<String>,
}

/// Posts the event graph as JSON to `{base_url}/{operation}`
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    base_url: String,
}

impl HttpSink {
    pub fn new(base_url: impl Into<String>) -> IngestResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build sink HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, operation: &str, event: &PaymentGatewayEvent) -> IngestResult<AssignedIds> {
        let url = format!("{}/{}", self.base_url, operation);
        let response = self
            .client
            .post(&url)
            .json(event)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                tracing::error!(url = %url, error = %e, "CRM sink rejected request");
                IngestError::Sink(e.to_string())
            })?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(AssignedIds::default());
        }
        serde_json::from_str(&body)
            .map_err(|e| IngestError::Sink(format!("Unreadable {} response: {}", operation, e)))
    }
}

#[async_trait]
impl AccountSink for HttpSink {
    async fn process_account(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        let ids = self.post("accounts", event).await?;
        if let Some(account_id) = ids.account_id {
            event.set_crm_account_id(account_id);
        }
        if let Some(contact_id) = ids.contact_id {
            event.set_crm_contact_id(contact_id);
        }
        Ok(())
    }
}

#[async_trait]
impl DonationSink for HttpSink {
    async fn create_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.post("donations", event).await.map(|_| ())
    }

    async fn refund_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.post("donations/refund", event).await.map(|_| ())
    }

    async fn process_subscription(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        let ids = self.post("recurring-donations", event).await?;
        if let Some(id) = ids.recurring_donation_id {
            event.set_crm_recurring_donation_id(id);
        }
        Ok(())
    }

    async fn close_recurring_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.post("recurring-donations/close", event).await.map(|_| ())
    }

    async fn charge_deposited(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.post("donations/deposit", event).await.map(|_| ())
    }
}
