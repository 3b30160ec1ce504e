//! Stripe wire objects
//!
//! Only the fields normalization reads are modelled. Every struct defaults
//! missing fields so payloads from newer API versions still decode; a payload
//! is rejected only when a field has the wrong type or the object tag names a
//! different kind of object.

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::metadata::Metadata;

/// Objects that carry a gateway id
pub trait Identifiable {
    fn object_id(&self) -> &str;
}

/// A reference to a related object: either its bare id or the expanded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T> Expandable<T> {
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(object) => Some(object),
        }
    }
}

impl<T: Identifiable> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(object) => object.object_id(),
        }
    }
}

/// Id of an optional reference, treating an empty id as absent
pub(crate) fn ref_id<T: Identifiable>(reference: &Option<Expandable<T>>) -> Option<&str> {
    reference
        .as_ref()
        .map(Expandable::id)
        .filter(|id| !id.is_empty())
}

/// Paginated list wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct List<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingDetails {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentMethodDetails {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub customer: Option<Expandable<Customer>>,
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    pub invoice: Option<Expandable<Invoice>>,
    pub balance_transaction: Option<Expandable<BalanceTransaction>>,
    pub billing_details: Option<BillingDetails>,
    pub payment_method_details: Option<PaymentMethodDetails>,
    pub receipt_email: Option<String>,
    pub description: Option<String>,
    pub application: Option<String>,
    pub status: String,
    pub created: Option<i64>,
    pub metadata: Metadata,
    pub refunds: Option<List<Refund>>,
}

impl Identifiable for Charge {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Charge {
    pub fn customer_id(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }

    pub fn invoice_id(&self) -> Option<&str> {
        ref_id(&self.invoice)
    }

    pub fn balance_transaction_id(&self) -> Option<&str> {
        ref_id(&self.balance_transaction)
    }

    pub fn payment_method_type(&self) -> &str {
        self.payment_method_details
            .as_ref()
            .map(|d| d.type_.as_str())
            .unwrap_or("")
    }

    /// First refund nested in the charge, if the payload carries one
    pub fn first_refund(&self) -> Option<&Refund> {
        self.refunds.as_ref().and_then(|r| r.data.first())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub customer: Option<Expandable<Customer>>,
    pub invoice: Option<Expandable<Invoice>>,
    pub description: Option<String>,
    pub application: Option<String>,
    pub status: String,
    pub created: Option<i64>,
    pub metadata: Metadata,
    /// Present on older API versions
    pub charges: Option<List<Charge>>,
    /// Replaces `charges` on newer API versions
    pub latest_charge: Option<Expandable<Charge>>,
}

impl Identifiable for PaymentIntent {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl PaymentIntent {
    pub fn customer_id(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn invoice_id(&self) -> Option<&str> {
        ref_id(&self.invoice)
    }

    /// Charges attached to the intent, newest-API shape included
    pub fn charge_list(&self) -> Vec<&Charge> {
        match &self.charges {
            Some(list) if !list.data.is_empty() => list.data.iter().collect(),
            _ => self
                .latest_charge
                .as_ref()
                .and_then(Expandable::as_object)
                .into_iter()
                .collect(),
        }
    }

    /// Id of the intent's first charge, expanded or not
    pub fn first_charge_id(&self) -> Option<&str> {
        self.charge_list()
            .first()
            .map(|c| c.id.as_str())
            .or_else(|| ref_id(&self.latest_charge))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
    pub charge: Option<Expandable<Charge>>,
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    pub created: Option<i64>,
    pub metadata: Metadata,
}

impl Identifiable for Refund {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Refund {
    pub fn charge_id(&self) -> Option<&str> {
        ref_id(&self.charge)
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        ref_id(&self.payment_intent)
    }
}

/// Card attached to a customer as a payment source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Card {
    pub id: String,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub address_zip: Option<String>,
    pub address_country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum PaymentSource {
    #[serde(rename = "card")]
    Card(Card),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub description: Option<String>,
    pub address: Option<Address>,
    pub metadata: Metadata,
    pub sources: Option<List<PaymentSource>>,
}

impl Identifiable for Customer {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Customer {
    /// First card among the customer's payment sources. The default source is
    /// deliberately not used since it is not guaranteed to be a card.
    pub fn first_card(&self) -> Option<&Card> {
        self.sources.as_ref().and_then(|sources| {
            sources.data.iter().find_map(|source| match source {
                PaymentSource::Card(card) => Some(card),
                PaymentSource::Other => None,
            })
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    pub id: String,
    pub name: Option<String>,
}

impl Identifiable for Product {
    fn object_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recurring {
    pub interval: String,
    pub interval_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Price {
    pub id: String,
    pub product: Option<Expandable<Product>>,
    pub unit_amount: Option<i64>,
    pub unit_amount_decimal: Option<String>,
    pub currency: Option<String>,
    pub recurring: Option<Recurring>,
}

impl Price {
    /// Unit amount in cents, preferring the decimal representation
    pub fn unit_amount_cents(&self) -> Option<f64> {
        self.unit_amount_decimal
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .or(self.unit_amount.map(|a| a as f64))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceLine {
    pub id: String,
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Invoice {
    pub id: String,
    pub subscription: Option<Expandable<Subscription>>,
    pub lines: Option<List<InvoiceLine>>,
}

impl Identifiable for Invoice {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Invoice {
    pub fn subscription_id(&self) -> Option<&str> {
        ref_id(&self.subscription)
    }

    /// Product ids referenced by the invoice's line items
    pub fn product_ids(&self) -> Vec<String> {
        self.lines
            .as_ref()
            .map(|lines| {
                lines
                    .data
                    .iter()
                    .filter_map(|line| line.price.as_ref())
                    .filter_map(|price| price.product.as_ref())
                    .map(|product| product.id().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Option<Price>,
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingInvoiceItemInterval {
    pub interval: String,
    pub interval_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    pub id: String,
    pub customer: Option<Expandable<Customer>>,
    pub status: String,
    pub start_date: Option<i64>,
    pub trial_end: Option<i64>,
    pub metadata: Metadata,
    pub items: List<SubscriptionItem>,
    pub pending_invoice_item_interval: Option<PendingInvoiceItemInterval>,
}

impl Identifiable for Subscription {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Subscription {
    pub fn customer_id(&self) -> Option<&str> {
        ref_id(&self.customer)
    }

    pub fn is_trialing(&self) -> bool {
        self.status.eq_ignore_ascii_case("trialing")
    }
}

/// What a balance transaction settled. Only charges matter for deposits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum BalanceTransactionSource {
    #[serde(rename = "charge")]
    Charge(Box<Charge>),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceTransaction {
    pub id: String,
    pub amount: i64,
    pub net: i64,
    pub fee: i64,
    pub currency: String,
    pub exchange_rate: Option<f64>,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Option<Expandable<BalanceTransactionSource>>,
}

impl Identifiable for BalanceTransaction {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl BalanceTransaction {
    /// The settled charge, when the source was expanded and is a charge
    pub fn source_charge(&self) -> Option<&Charge> {
        match self.source.as_ref().and_then(Expandable::as_object) {
            Some(BalanceTransactionSource::Charge(charge)) => Some(charge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payout {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub arrival_date: i64,
    pub status: String,
}

impl Identifiable for Payout {
    fn object_id(&self) -> &str {
        &self.id
    }
}

/// Any gateway object a handled webhook can carry, keyed by its `object` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum GatewayObject {
    Charge(Box<Charge>),
    PaymentIntent(Box<PaymentIntent>),
    Refund(Box<Refund>),
    Subscription(Box<Subscription>),
    Payout(Box<Payout>),
    #[serde(other)]
    Other,
}

impl GatewayObject {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayObject::Charge(_) => "charge",
            GatewayObject::PaymentIntent(_) => "payment_intent",
            GatewayObject::Refund(_) => "refund",
            GatewayObject::Subscription(_) => "subscription",
            GatewayObject::Payout(_) => "payout",
            GatewayObject::Other => "other",
        }
    }
}

/// `charge.refunded` arrives either as the refunded charge (with its refunds
/// nested) or as the refund itself, depending on the account's API version.
#[derive(Debug, Clone, PartialEq)]
pub enum RefundPayload {
    Charge(Box<Charge>),
    Refund(Box<Refund>),
}

impl RefundPayload {
    /// The refund both shapes describe. A charge payload without nested
    /// refunds cannot identify one.
    pub fn refund(&self) -> Option<Refund> {
        match self {
            RefundPayload::Refund(refund) => Some((**refund).clone()),
            RefundPayload::Charge(charge) => charge.first_refund().map(|nested| {
                let mut refund = nested.clone();
                // Nested refunds may omit their parent references
                if refund.charge_id().is_none() {
                    refund.charge = Some(Expandable::Id(charge.id.clone()));
                }
                if refund.payment_intent_id().is_none() {
                    refund.payment_intent = charge
                        .payment_intent_id()
                        .map(|id| Expandable::Id(id.to_string()));
                }
                refund
            }),
        }
    }
}

/// Webhook event types with a processing path
pub mod event_types {
    pub const CHARGE_SUCCEEDED: &str = "charge.succeeded";
    pub const CHARGE_FAILED: &str = "charge.failed";
    pub const CHARGE_REFUNDED: &str = "charge.refunded";
    pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
    pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";
    pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
    pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
    pub const PAYOUT_PAID: &str = "payout.paid";
}

/// Decoded `data.object` of a webhook, by event type
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    ChargeSucceeded(Box<Charge>),
    ChargeFailed(Box<Charge>),
    PaymentIntentSucceeded(Box<PaymentIntent>),
    PaymentIntentFailed(Box<PaymentIntent>),
    ChargeRefunded(RefundPayload),
    SubscriptionCreated(Box<Subscription>),
    SubscriptionDeleted(Box<Subscription>),
    PayoutPaid(Box<Payout>),
    /// Any event type without a processing path
    Unhandled,
}

impl WebhookEvent {
    /// Key that serializes processing: events for the same donor run in order.
    ///
    /// A bare refund only names its customer when the charge or intent is
    /// expanded. Otherwise it is keyed by the charge id and may run on a
    /// different lane than the donor's other events; the CRM matches refunds
    /// to donations by transaction id, so an early refund is a sink concern.
    pub fn ordering_key(&self) -> Option<String> {
        let key = match self {
            WebhookEvent::ChargeSucceeded(charge) | WebhookEvent::ChargeFailed(charge) => {
                charge.customer_id().unwrap_or(charge.id.as_str())
            }
            WebhookEvent::PaymentIntentSucceeded(intent)
            | WebhookEvent::PaymentIntentFailed(intent) => {
                intent.customer_id().unwrap_or(intent.id.as_str())
            }
            WebhookEvent::ChargeRefunded(RefundPayload::Charge(charge)) => {
                charge.customer_id().unwrap_or(charge.id.as_str())
            }
            WebhookEvent::ChargeRefunded(RefundPayload::Refund(refund)) => refund
                .charge
                .as_ref()
                .and_then(Expandable::as_object)
                .and_then(Charge::customer_id)
                .or_else(|| {
                    refund
                        .payment_intent
                        .as_ref()
                        .and_then(Expandable::as_object)
                        .and_then(PaymentIntent::customer_id)
                })
                .or(refund.charge_id())
                .or(refund.payment_intent_id())
                .unwrap_or(refund.id.as_str()),
            WebhookEvent::SubscriptionCreated(sub) | WebhookEvent::SubscriptionDeleted(sub) => {
                sub.customer_id().unwrap_or(sub.id.as_str())
            }
            WebhookEvent::PayoutPaid(payout) => payout.id.as_str(),
            WebhookEvent::Unhandled => return None,
        };
        Some(key.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    created: Option<i64>,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A decoded webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub id: String,
    pub event_type: String,
    pub created: Option<i64>,
    pub event: WebhookEvent,
}

impl WebhookEnvelope {
    /// Decode the envelope and, for handled types, its object. The object's
    /// `object` tag must match what the event type carries.
    pub fn decode(payload: &str) -> IngestResult<Self> {
        use self::event_types::*;

        let raw: RawEnvelope = serde_json::from_str(payload)?;

        let handled = matches!(
            raw.type_.as_str(),
            CHARGE_SUCCEEDED
                | CHARGE_FAILED
                | CHARGE_REFUNDED
                | PAYMENT_INTENT_SUCCEEDED
                | PAYMENT_INTENT_FAILED
                | SUBSCRIPTION_CREATED
                | SUBSCRIPTION_DELETED
                | PAYOUT_PAID
        );
        if !handled {
            return Ok(Self {
                id: raw.id,
                event_type: raw.type_,
                created: raw.created,
                event: WebhookEvent::Unhandled,
            });
        }

        let object: GatewayObject = serde_json::from_value(raw.data.object)?;
        let mismatch = |object: &GatewayObject| {
            IngestError::UnsupportedObject {
                event_type: raw.type_.clone(),
                detail: format!("unexpected {} object", object.kind()),
            }
        };

        let event = match (raw.type_.as_str(), object) {
            (CHARGE_SUCCEEDED, GatewayObject::Charge(c)) => WebhookEvent::ChargeSucceeded(c),
            (CHARGE_FAILED, GatewayObject::Charge(c)) => WebhookEvent::ChargeFailed(c),
            (PAYMENT_INTENT_SUCCEEDED, GatewayObject::PaymentIntent(pi)) => {
                WebhookEvent::PaymentIntentSucceeded(pi)
            }
            (PAYMENT_INTENT_FAILED, GatewayObject::PaymentIntent(pi)) => {
                WebhookEvent::PaymentIntentFailed(pi)
            }
            (CHARGE_REFUNDED, GatewayObject::Charge(c)) => {
                WebhookEvent::ChargeRefunded(RefundPayload::Charge(c))
            }
            (CHARGE_REFUNDED, GatewayObject::Refund(r)) => {
                WebhookEvent::ChargeRefunded(RefundPayload::Refund(r))
            }
            (SUBSCRIPTION_CREATED, GatewayObject::Subscription(s)) => {
                WebhookEvent::SubscriptionCreated(s)
            }
            (SUBSCRIPTION_DELETED, GatewayObject::Subscription(s)) => {
                WebhookEvent::SubscriptionDeleted(s)
            }
            (PAYOUT_PAID, GatewayObject::Payout(p)) => WebhookEvent::PayoutPaid(p),
            (_, other) => return Err(mismatch(&other)),
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.type_,
            created: raw.created,
            event,
        })
    }

    pub fn ordering_key(&self) -> String {
        self.event.ordering_key().unwrap_or_else(|| self.id.clone())
    }
}
