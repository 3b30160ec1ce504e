//! Canonical event accumulator
//!
//! A [`PaymentGatewayEvent`] turns one primary gateway object (charge, payment
//! intent, refund or subscription) plus whatever related objects were fetched
//! for it into the CRM-shaped record graph handed to sinks.
//!
//! Identity always resolves last: names, contact details and addresses depend
//! on the metadata of every object seen, so the customer step runs once all
//! tiers are populated.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::IngestConfig;
use crate::gateway::{
    Address, BalanceTransaction, BillingDetails, Card, Charge, Customer, Invoice, PaymentIntent,
    Payout, Refund, Subscription,
};
use crate::metadata::{
    parse_flag, resolve_identity, Metadata, MetadataTiers, ResolvedIdentity, IDENTITY_RULES,
};
use crate::model::{
    CrmAccount, CrmAddress, CrmContact, CrmDonation, CrmRecurringDonation, DonationStatus,
    Frequency,
};

pub const GATEWAY_NAME: &str = "Stripe";
const DASHBOARD_URL: &str = "https://dashboard.stripe.com";

pub const ANONYMOUS_ACCOUNT_NAME: &str = "Anonymous Account";
pub const ANONYMOUS_FIRST_NAME: &str = "Anonymous";
pub const ANONYMOUS_LAST_NAME: &str = "Contact";

/// Related objects fetched for a charge or payment intent. Any of them may be
/// missing: a guest checkout has no customer, a one-off gift has no invoice and
/// an unsettled payment has no balance transaction.
#[derive(Debug, Clone, Default)]
pub struct RelatedObjects {
    pub customer: Option<Customer>,
    pub invoice: Option<Invoice>,
    pub balance_transaction: Option<BalanceTransaction>,
}

/// Fields the charge and payment intent paths have in common
struct TransactionFields<'a> {
    id: &'a str,
    amount: i64,
    currency: &'a str,
    created: Option<i64>,
    description: Option<&'a str>,
    application: Option<&'a str>,
    metadata: &'a Metadata,
    payment_method_type: &'a str,
    status: DonationStatus,
    url: String,
    secondary_id: Option<&'a str>,
    billing_details: Option<&'a BillingDetails>,
    receipt_email: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentGatewayEvent {
    #[serde(skip)]
    config: Arc<IngestConfig>,
    pub account: CrmAccount,
    pub contact: CrmContact,
    pub donation: CrmDonation,
    pub recurring_donation: CrmRecurringDonation,
    metadata: MetadataTiers,
}

impl PaymentGatewayEvent {
    pub fn new(config: Arc<IngestConfig>) -> Self {
        Self {
            config,
            account: CrmAccount::default(),
            contact: CrmContact::default(),
            donation: CrmDonation {
                gateway_name: GATEWAY_NAME.to_string(),
                ..Default::default()
            },
            recurring_donation: CrmRecurringDonation {
                gateway_name: GATEWAY_NAME.to_string(),
                ..Default::default()
            },
            metadata: MetadataTiers::new(),
        }
    }

    pub fn from_charge(config: Arc<IngestConfig>, charge: &Charge, related: &RelatedObjects) -> Self {
        let mut event = Self::new(config);
        let status = if charge.status.eq_ignore_ascii_case("failed") {
            DonationStatus::Failed
        } else {
            DonationStatus::Successful
        };

        event.init_transaction(
            TransactionFields {
                id: &charge.id,
                amount: charge.amount,
                currency: &charge.currency,
                created: charge.created,
                description: charge.description.as_deref(),
                application: charge.application.as_deref(),
                metadata: &charge.metadata,
                payment_method_type: charge.payment_method_type(),
                status,
                url: format!("{}/charges/{}", DASHBOARD_URL, charge.id),
                secondary_id: None,
                billing_details: charge.billing_details.as_ref(),
                receipt_email: charge.receipt_email.as_deref(),
            },
            related,
        );
        event
    }

    pub fn from_payment_intent(
        config: Arc<IngestConfig>,
        intent: &PaymentIntent,
        related: &RelatedObjects,
    ) -> Self {
        let mut event = Self::new(config);
        let first_charge = intent.charge_list().into_iter().next();
        // Intents pass through several unsuccessful states, so only an explicit success counts
        let status = if intent.status.eq_ignore_ascii_case("succeeded") {
            DonationStatus::Successful
        } else {
            DonationStatus::Failed
        };

        event.init_transaction(
            TransactionFields {
                id: &intent.id,
                amount: intent.amount,
                currency: &intent.currency,
                created: intent.created,
                description: intent.description.as_deref(),
                application: intent.application.as_deref(),
                metadata: &intent.metadata,
                payment_method_type: first_charge.map(Charge::payment_method_type).unwrap_or(""),
                status,
                url: format!("{}/payments/{}", DASHBOARD_URL, intent.id),
                secondary_id: intent.first_charge_id(),
                billing_details: first_charge.and_then(|c| c.billing_details.as_ref()),
                receipt_email: first_charge.and_then(|c| c.receipt_email.as_deref()),
            },
            related,
        );
        event
    }

    /// A refund needs no enrichment: it only identifies the donation to reverse
    pub fn from_refund(config: Arc<IngestConfig>, refund: &Refund) -> Self {
        let mut event = Self::new(config);
        event.metadata = std::mem::take(&mut event.metadata).with_donation(refund.metadata.clone());

        event.donation.refund_id = Some(refund.id.clone());
        match refund.payment_intent_id() {
            Some(intent_id) => {
                event.donation.transaction_id = Some(intent_id.to_string());
                event.donation.secondary_id = refund.charge_id().map(str::to_string);
            }
            None => {
                event.donation.transaction_id = refund.charge_id().map(str::to_string);
            }
        }
        event.donation.refund_date = Some(timestamp_or_now(refund.created));
        event
    }

    pub fn from_subscription(
        config: Arc<IngestConfig>,
        subscription: &Subscription,
        customer: &Customer,
    ) -> Self {
        let mut event = Self::new(config);
        event.init_subscription(subscription);
        event.init_customer(Some(customer), None, None);
        event
    }

    fn init_transaction(&mut self, tx: TransactionFields<'_>, related: &RelatedObjects) {
        self.metadata = std::mem::take(&mut self.metadata).with_donation(tx.metadata.clone());

        let donation = &mut self.donation;
        donation.application = tx.application.and_then(non_empty);
        donation.payment_method = Some(payment_method_name(tx.payment_method_type).to_string());
        donation.close_date = Some(timestamp_or_now(tx.created));
        donation.description = tx.description.and_then(non_empty);
        donation.transaction_id = Some(tx.id.to_string());
        donation.secondary_id = tx.secondary_id.map(str::to_string);
        donation.status = tx.status;
        donation.url = Some(tx.url);
        donation.original_amount_in_dollars = Some(cents_to_dollars(tx.amount));
        donation.original_currency = Some(tx.currency.to_ascii_uppercase());

        if let Some(bt) = &related.balance_transaction {
            donation.deposit_transaction_id = Some(bt.id.clone());
            donation.net_amount_in_dollars = Some(cents_to_dollars(bt.net));
            donation.fee_in_dollars = Some(cents_to_dollars(bt.fee));
        }

        if self.config.is_org_currency(tx.currency) {
            donation.amount = Some(cents_to_dollars(tx.amount));
        } else {
            // Converted values only exist once the gateway settles, so a pending
            // or failed cross-currency payment leaves the amount unknown.
            donation.currency_converted = true;
            match &related.balance_transaction {
                Some(bt) => {
                    donation.amount = Some(cents_to_dollars(bt.amount));
                    donation.exchange_rate = bt.exchange_rate;
                }
                None => {
                    tracing::debug!(
                        transaction_id = %tx.id,
                        currency = %tx.currency,
                        "Cross-currency transaction not yet settled, amount left empty"
                    );
                }
            }
        }

        if let Some(invoice) = &related.invoice {
            self.donation.products = invoice.product_ids();
            if let Some(subscription) = invoice.subscription.as_ref().and_then(|s| s.as_object()) {
                self.init_subscription(subscription);
            } else if let Some(subscription_id) = invoice.subscription_id() {
                self.recurring_donation.subscription_id = Some(subscription_id.to_string());
            }
        }

        self.init_customer(related.customer.as_ref(), tx.billing_details, tx.receipt_email);
    }

    fn init_subscription(&mut self, subscription: &Subscription) {
        self.metadata =
            std::mem::take(&mut self.metadata).with_recurring_donation(subscription.metadata.clone());

        let recurring = &mut self.recurring_donation;
        recurring.subscription_id = Some(subscription.id.clone());
        recurring.customer_id = subscription.customer_id().map(str::to_string);
        recurring.active = !matches!(
            subscription.status.to_ascii_lowercase().as_str(),
            "canceled" | "incomplete_expired"
        );

        let start = subscription
            .trial_end
            .or(subscription.start_date)
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        recurring.start_date = start;
        recurring.next_date = start;

        let item = subscription.items.data.first();
        let price = item.and_then(|i| i.price.as_ref());

        recurring.frequency = match (
            price.and_then(|p| p.recurring.as_ref()),
            &subscription.pending_invoice_item_interval,
        ) {
            (Some(interval), _) => Frequency::from_interval(&interval.interval, interval.interval_count),
            (None, Some(pending)) => Frequency::from_interval(&pending.interval, pending.interval_count),
            (None, None) => Frequency::Monthly,
        };

        if let (Some(item), Some(price)) = (item, price) {
            let quantity = item.quantity.unwrap_or(1) as f64;
            recurring.amount = price.unit_amount_cents().map(|cents| cents * quantity / 100.0);
            recurring.currency = price.currency.as_deref().map(str::to_ascii_uppercase);
        }

        recurring.description = subscription.metadata.value("description");
    }

    fn init_customer(
        &mut self,
        customer: Option<&Customer>,
        billing: Option<&BillingDetails>,
        receipt_email: Option<&str>,
    ) {
        if let Some(customer) = customer {
            let metadata = customer.metadata.clone();
            self.metadata = std::mem::take(&mut self.metadata)
                .with_contact(metadata.clone())
                .with_account(metadata);
            self.donation.customer_id = Some(customer.id.clone());
            self.recurring_donation.customer_id = Some(customer.id.clone());
        } else {
            tracing::debug!(
                transaction_id = ?self.donation.transaction_id,
                "No customer available, identity comes from billing details and metadata"
            );
        }

        let identity = resolve_identity(&self.metadata, IDENTITY_RULES);

        self.contact.email = customer
            .and_then(|c| c.email.as_deref())
            .and_then(non_empty)
            .or_else(|| billing.and_then(|b| b.email.as_deref()).and_then(non_empty))
            .or_else(|| receipt_email.and_then(non_empty))
            .or_else(|| identity.email.clone());
        self.account.email = self.contact.email.clone();

        self.contact.mobile_phone = customer
            .and_then(|c| c.phone.as_deref())
            .and_then(non_empty)
            .or_else(|| billing.and_then(|b| b.phone.as_deref()).and_then(non_empty))
            .or_else(|| identity.phone.clone());

        let opt_in = identity.email_opt_in.as_deref().and_then(parse_flag);
        let opt_out = identity.email_opt_out.as_deref().and_then(parse_flag);
        self.contact.email_opt_in = opt_in;
        self.contact.email_opt_out = opt_out;
        self.account.email_opt_in = opt_in;
        self.account.email_opt_out = opt_out;

        self.init_name(customer, billing, &identity);
        self.init_address(customer, billing, &identity);
        self.apply_configured_ids();
    }

    fn init_name(
        &mut self,
        customer: Option<&Customer>,
        billing: Option<&BillingDetails>,
        identity: &ResolvedIdentity,
    ) {
        let mut full_name = customer
            .and_then(|c| c.name.as_deref())
            .and_then(non_empty)
            .or_else(|| identity.full_name.clone())
            // Some forms put the email address in the billing name when no name was given
            .or_else(|| {
                billing
                    .and_then(|b| b.name.as_deref())
                    .filter(|name| !name.contains('@'))
                    .and_then(non_empty)
            })
            .or_else(|| customer.and_then(|c| c.description.as_deref()).and_then(non_empty));

        let mut first_name = identity.first_name.clone();
        let mut last_name = identity.last_name.clone();

        if last_name.is_none() {
            if let Some(full) = &full_name {
                let (first, last) = split_full_name(full);
                first_name = first;
                last_name = last;
            }
        }

        if full_name.is_none() {
            if let (Some(first), Some(last)) = (&first_name, &last_name) {
                full_name = Some(format!("{} {}", first, last));
            }
        }

        if full_name.is_none() && last_name.is_none() {
            full_name = Some(ANONYMOUS_ACCOUNT_NAME.to_string());
            first_name = Some(ANONYMOUS_FIRST_NAME.to_string());
            last_name = Some(ANONYMOUS_LAST_NAME.to_string());
        }

        self.account.name = full_name;
        self.contact.first_name = first_name;
        self.contact.last_name = last_name;
    }

    fn init_address(
        &mut self,
        customer: Option<&Customer>,
        billing: Option<&BillingDetails>,
        identity: &ResolvedIdentity,
    ) {
        let mut address = match customer {
            Some(Customer {
                address: Some(address),
                ..
            }) => address_from_gateway(address),
            Some(customer) => customer.first_card().map(address_from_card).unwrap_or_default(),
            None => CrmAddress::default(),
        };

        if address.street.is_none() {
            if let Some(billing_address) = billing.and_then(|b| b.address.as_ref()) {
                address = address_from_gateway(billing_address);
            }
        }

        if address.street.is_none() {
            address.street = identity.street.clone();
        }
        if address.city.is_none() {
            address.city = identity.city.clone();
        }
        if address.state.is_none() {
            address.state = identity.state.clone();
        }
        if address.postal_code.is_none() {
            address.postal_code = identity.postal_code.clone();
        }
        if address.country.is_none() {
            address.country = identity.country.clone();
        }

        self.account.billing_address = address.clone();
        self.account.mailing_address = address.clone();
        self.contact.mailing_address = address;
    }

    /// Ids carried in configured metadata keys
    fn apply_configured_ids(&mut self) {
        let keys = &self.config.metadata_keys;
        let campaign_id = self.metadata.value(&keys.campaign);
        let record_type_id = self.metadata.value(&keys.record_type);
        let account_id = self.metadata.value(&keys.account);
        let contact_id = self.metadata.value(&keys.contact);

        self.donation.campaign_id = campaign_id;
        self.donation.record_type_id = record_type_id.clone();
        self.account.record_type_id = record_type_id;

        if let Some(account_id) = account_id {
            self.set_crm_account_id(account_id);
        }
        if let Some(contact_id) = contact_id {
            self.set_crm_contact_id(contact_id);
        }
    }

    pub fn set_crm_account_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.account.id = Some(id.clone());
        self.contact.account_id = Some(id.clone());
        self.donation.account_id = Some(id.clone());
        self.recurring_donation.account_id = Some(id);
    }

    pub fn set_crm_contact_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.contact.id = Some(id.clone());
        self.donation.contact_id = Some(id.clone());
        self.recurring_donation.contact_id = Some(id);
    }

    pub fn set_crm_recurring_donation_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.recurring_donation.id = Some(id.clone());
        self.donation.recurring_donation_id = Some(id);
    }

    /// Link the donation to the payout that deposited it
    pub fn set_deposit(&mut self, payout: &Payout) {
        self.donation.deposit_id = Some(payout.id.clone());
        self.donation.deposit_date = OffsetDateTime::from_unix_timestamp(payout.arrival_date).ok();
    }

    /// Fund designation from the configured fund keys
    pub fn fund(&self) -> Option<String> {
        self.metadata.value(&self.config.metadata_keys.fund)
    }

    pub fn is_transaction_recurring(&self) -> bool {
        self.recurring_donation.subscription_id.is_some()
    }

    /// Best available human label for log lines
    pub fn donor_name(&self) -> &str {
        self.account.name.as_deref().unwrap_or(ANONYMOUS_ACCOUNT_NAME)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn timestamp_or_now(ts: Option<i64>) -> OffsetDateTime {
    ts.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

fn payment_method_name(method_type: &str) -> &'static str {
    if method_type.to_ascii_lowercase().contains("ach") {
        "ACH"
    } else {
        "Credit Card"
    }
}

fn join_street(line1: Option<&str>, line2: Option<&str>) -> Option<String> {
    let line1 = line1.and_then(non_empty)?;
    match line2.and_then(non_empty) {
        Some(line2) => Some(format!("{}, {}", line1, line2)),
        None => Some(line1),
    }
}

fn address_from_gateway(address: &Address) -> CrmAddress {
    CrmAddress {
        street: join_street(address.line1.as_deref(), address.line2.as_deref()),
        city: address.city.as_deref().and_then(non_empty),
        state: address.state.as_deref().and_then(non_empty),
        postal_code: address.postal_code.as_deref().and_then(non_empty),
        country: address.country.as_deref().and_then(non_empty),
    }
}

fn address_from_card(card: &Card) -> CrmAddress {
    CrmAddress {
        street: join_street(card.address_line1.as_deref(), card.address_line2.as_deref()),
        city: card.address_city.as_deref().and_then(non_empty),
        state: card.address_state.as_deref().and_then(non_empty),
        postal_code: card.address_zip.as_deref().and_then(non_empty),
        country: card.address_country.as_deref().and_then(non_empty),
    }
}

/// Split a full name into (first, last). The last whitespace-separated token
/// is the last name; a single token yields only a last name.
pub fn split_full_name(full_name: &str) -> (Option<String>, Option<String>) {
    let tokens: Vec<&str> = full_name.split_whitespace().collect();
    match tokens.split_last() {
        None => (None, None),
        Some((last, [])) => (None, Some(last.to_string())),
        Some((last, rest)) => (Some(rest.join(" ")), Some(last.to_string())),
    }
}
