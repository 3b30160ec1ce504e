//! In-memory collaborators for tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::event::PaymentGatewayEvent;
use crate::fetcher::{ArrivalWindow, GatewayObjectFetcher, PAGE_LIMIT};
use crate::gateway::{
    BalanceTransaction, BalanceTransactionSource, Charge, Customer, Expandable, Invoice, List,
    PaymentIntent, Payout,
};
use crate::metadata::MetadataKeys;
use crate::processor::EventProcessor;
use crate::sink::{AccountSink, DonationSink, Sinks};

/// Gateway fetcher backed by maps. Every call is recorded as `"<kind>:<id>"`.
#[derive(Default)]
pub struct InMemoryFetcher {
    customers: HashMap<String, Customer>,
    invoices: HashMap<String, Invoice>,
    balance_transactions: HashMap<String, BalanceTransaction>,
    payment_intents: HashMap<String, PaymentIntent>,
    payout_transactions: HashMap<String, Vec<BalanceTransaction>>,
    payouts: Vec<Payout>,
    hanging_customers: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, customer: Customer) -> Self {
        self.customers.insert(customer.id.clone(), customer);
        self
    }

    pub fn with_invoice(mut self, invoice: Invoice) -> Self {
        self.invoices.insert(invoice.id.clone(), invoice);
        self
    }

    pub fn with_balance_transaction(mut self, bt: BalanceTransaction) -> Self {
        self.balance_transactions.insert(bt.id.clone(), bt);
        self
    }

    pub fn with_payment_intent(mut self, intent: PaymentIntent) -> Self {
        self.payment_intents.insert(intent.id.clone(), intent);
        self
    }

    pub fn with_payout(mut self, payout: Payout, transactions: Vec<BalanceTransaction>) -> Self {
        self.payout_transactions.insert(payout.id.clone(), transactions);
        self.payouts.push(payout);
        self
    }

    /// Lookups of this customer never complete
    pub fn hanging_customer(mut self, id: &str) -> Self {
        self.hanging_customers.insert(id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, kind: &str) -> usize {
        let prefix = format!("{}:", kind);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, kind: &str, id: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", kind, id));
    }
}

fn missing(kind: &str, id: &str) -> IngestError {
    IngestError::StripeApi(format!("No such {}: '{}'", kind, id))
}

fn page_after<T: Clone>(items: &[T], id_of: impl Fn(&T) -> &str, starting_after: Option<&str>) -> List<T> {
    let start = match starting_after {
        Some(cursor) => items
            .iter()
            .position(|item| id_of(item) == cursor)
            .map(|i| i + 1)
            .unwrap_or(items.len()),
        None => 0,
    };
    let end = (start + PAGE_LIMIT).min(items.len());
    List {
        data: items[start..end].to_vec(),
        has_more: end < items.len(),
    }
}

#[async_trait]
impl GatewayObjectFetcher for InMemoryFetcher {
    async fn customer(&self, id: &str) -> IngestResult<Customer> {
        self.record("customer", id);
        if self.hanging_customers.contains(id) {
            std::future::pending::<()>().await;
        }
        self.customers.get(id).cloned().ok_or_else(|| missing("customer", id))
    }

    async fn invoice(&self, id: &str) -> IngestResult<Invoice> {
        self.record("invoice", id);
        self.invoices.get(id).cloned().ok_or_else(|| missing("invoice", id))
    }

    async fn balance_transaction(&self, id: &str) -> IngestResult<BalanceTransaction> {
        self.record("balance_transaction", id);
        self.balance_transactions
            .get(id)
            .cloned()
            .ok_or_else(|| missing("balance_transaction", id))
    }

    async fn payment_intent(&self, id: &str) -> IngestResult<PaymentIntent> {
        self.record("payment_intent", id);
        self.payment_intents
            .get(id)
            .cloned()
            .ok_or_else(|| missing("payment_intent", id))
    }

    async fn balance_transactions_page(
        &self,
        payout_id: &str,
        starting_after: Option<&str>,
    ) -> IngestResult<List<BalanceTransaction>> {
        self.record("balance_transactions_page", payout_id);
        let items = self
            .payout_transactions
            .get(payout_id)
            .ok_or_else(|| missing("payout", payout_id))?;
        Ok(page_after(items, |bt| bt.id.as_str(), starting_after))
    }

    async fn payouts_page(
        &self,
        window: ArrivalWindow,
        starting_after: Option<&str>,
    ) -> IngestResult<List<Payout>> {
        self.record("payouts_page", &window.gte.to_string());
        let in_window: Vec<Payout> = self
            .payouts
            .iter()
            .filter(|p| p.arrival_date >= window.gte && p.arrival_date < window.lt)
            .cloned()
            .collect();
        Ok(page_after(&in_window, |p| p.id.as_str(), starting_after))
    }
}

/// One sink call and the event as the sink saw it
#[derive(Debug, Clone)]
pub struct SinkCall {
    pub operation: &'static str,
    pub event: PaymentGatewayEvent,
}

/// Records every call. Assigns fixed CRM ids so threading can be checked.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_deposits_for: HashSet<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `charge_deposited` fail for this transaction id
    pub fn failing_deposit(mut self, transaction_id: &str) -> Self {
        self.fail_deposits_for.insert(transaction_id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|c| c.operation).collect()
    }

    pub fn events_for(&self, operation: &str) -> Vec<PaymentGatewayEvent> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.event.clone())
            .collect()
    }

    fn record(&self, operation: &'static str, event: &PaymentGatewayEvent) {
        self.calls.lock().unwrap().push(SinkCall {
            operation,
            event: event.clone(),
        });
    }
}

#[async_trait]
impl AccountSink for RecordingSink {
    async fn process_account(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        event.set_crm_account_id("acc_crm");
        event.set_crm_contact_id("con_crm");
        self.record("process_account", event);
        Ok(())
    }
}

#[async_trait]
impl DonationSink for RecordingSink {
    async fn create_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.record("create_donation", event);
        Ok(())
    }

    async fn refund_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.record("refund_donation", event);
        Ok(())
    }

    async fn process_subscription(&self, event: &mut PaymentGatewayEvent) -> IngestResult<()> {
        event.set_crm_recurring_donation_id("rd_crm");
        self.record("process_subscription", event);
        Ok(())
    }

    async fn close_recurring_donation(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        self.record("close_recurring_donation", event);
        Ok(())
    }

    async fn charge_deposited(&self, event: &PaymentGatewayEvent) -> IngestResult<()> {
        let failing = event
            .donation
            .transaction_id
            .as_ref()
            .is_some_and(|id| self.fail_deposits_for.contains(id));
        if failing {
            return Err(IngestError::Sink("deposit rejected".to_string()));
        }
        self.record("charge_deposited", event);
        Ok(())
    }
}

pub fn usd_config() -> Arc<IngestConfig> {
    Arc::new(IngestConfig::new("USD", MetadataKeys::default()))
}

/// Processor wired to the given fetcher and a fresh recording sink
pub fn processor_with(
    fetcher: Arc<InMemoryFetcher>,
    config: Arc<IngestConfig>,
) -> (EventProcessor, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let processor = EventProcessor::new(fetcher, config, Sinks::new(sink.clone(), sink.clone()));
    (processor, sink)
}

pub fn customer(id: &str, name: &str) -> Customer {
    Customer {
        id: id.to_string(),
        name: Some(name.to_string()),
        email: Some(format!("{}@example.org", id)),
        ..Default::default()
    }
}

pub fn charge(id: &str, customer_id: Option<&str>, amount: i64, currency: &str) -> Charge {
    Charge {
        id: id.to_string(),
        amount,
        currency: currency.to_string(),
        customer: customer_id.map(|c| Expandable::Id(c.to_string())),
        status: "succeeded".to_string(),
        created: Some(1_709_294_400),
        ..Default::default()
    }
}

/// Balance transaction settling `charge`, with the charge expanded as its source
pub fn settled(bt_id: &str, charge: Charge) -> BalanceTransaction {
    BalanceTransaction {
        id: bt_id.to_string(),
        amount: charge.amount,
        net: charge.amount - 30,
        fee: 30,
        currency: charge.currency.clone(),
        type_: "charge".to_string(),
        source: Some(Expandable::Object(Box::new(BalanceTransactionSource::Charge(
            Box::new(charge),
        )))),
        ..Default::default()
    }
}
