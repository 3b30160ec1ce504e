//! CRM-agnostic records produced from gateway events
//!
//! Records are built fresh for every event and carry no identity until a sink
//! assigns one. Ids assigned by sinks are threaded back through
//! [`crate::event::PaymentGatewayEvent`].

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmAddress {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl CrmAddress {
    pub fn is_empty(&self) -> bool {
        self.street.is_none()
            && self.city.is_none()
            && self.state.is_none()
            && self.postal_code.is_none()
            && self.country.is_none()
    }
}

/// Organization or household the donor belongs to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmAccount {
    pub id: Option<String>,
    pub name: Option<String>,
    pub billing_address: CrmAddress,
    pub mailing_address: CrmAddress,
    pub email: Option<String>,
    pub email_opt_in: Option<bool>,
    pub email_opt_out: Option<bool>,
    pub email_bounced: Option<bool>,
    pub owner_id: Option<String>,
    pub record_type_id: Option<String>,
}

impl CrmAccount {
    /// Opted-out or bounced accounts never receive email; otherwise an
    /// explicit opt-in decides, and the default is yes.
    pub fn can_receive_email(&self) -> bool {
        if self.email_opt_out == Some(true) || self.email_bounced == Some(true) {
            return false;
        }
        self.email_opt_in.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredPhone {
    Home,
    #[default]
    Mobile,
    Work,
    Other,
}

impl PreferredPhone {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "home" | "household" => PreferredPhone::Home,
            "work" => PreferredPhone::Work,
            "other" => PreferredPhone::Other,
            _ => PreferredPhone::Mobile,
        }
    }
}

/// Individual donor, always linked to exactly one account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: Option<String>,
    pub account_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub home_phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub work_phone: Option<String>,
    pub preferred_phone: PreferredPhone,
    pub mailing_address: CrmAddress,
    pub email_opt_in: Option<bool>,
    pub email_opt_out: Option<bool>,
    pub email_bounced: Option<bool>,
    pub owner_id: Option<String>,
}

impl CrmContact {
    pub fn can_receive_email(&self) -> bool {
        if self.email_opt_out == Some(true) || self.email_bounced == Some(true) {
            return false;
        }
        self.email_opt_in.unwrap_or(true)
    }

    /// Number selected by `preferred_phone`, falling back to any known number
    pub fn phone(&self) -> Option<&str> {
        let preferred = match self.preferred_phone {
            PreferredPhone::Home => self.home_phone.as_deref(),
            PreferredPhone::Work => self.work_phone.as_deref(),
            PreferredPhone::Mobile | PreferredPhone::Other => self.mobile_phone.as_deref(),
        };
        preferred
            .or(self.mobile_phone.as_deref())
            .or(self.home_phone.as_deref())
            .or(self.work_phone.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationStatus {
    #[default]
    Successful,
    Failed,
}

/// One financial transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmDonation {
    pub id: Option<String>,
    pub account_id: Option<String>,
    pub contact_id: Option<String>,
    pub recurring_donation_id: Option<String>,

    pub gateway_name: String,
    pub customer_id: Option<String>,
    pub transaction_id: Option<String>,
    /// Charge id when the transaction id is a payment intent, and vice versa
    pub secondary_id: Option<String>,
    pub status: DonationStatus,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub application: Option<String>,
    pub products: Vec<String>,
    pub campaign_id: Option<String>,
    pub record_type_id: Option<String>,

    pub original_amount_in_dollars: Option<f64>,
    pub original_currency: Option<String>,
    /// Amount in the organization's currency. Unknown for cross-currency
    /// transactions until the gateway settles them.
    pub amount: Option<f64>,
    pub currency_converted: bool,
    pub exchange_rate: Option<f64>,
    pub net_amount_in_dollars: Option<f64>,
    pub fee_in_dollars: Option<f64>,

    #[serde(with = "time::serde::rfc3339::option")]
    pub close_date: Option<OffsetDateTime>,

    pub refund_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refund_date: Option<OffsetDateTime>,

    pub deposit_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deposit_date: Option<OffsetDateTime>,
    pub deposit_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Yearly,
    Biannually,
}

impl Frequency {
    /// Map a gateway billing interval. Unknown intervals are monthly.
    pub fn from_interval(interval: &str, count: Option<u64>) -> Self {
        let count = count.unwrap_or(1);
        match interval.trim().to_ascii_lowercase().as_str() {
            "week" | "weekly" => Frequency::Weekly,
            "month" | "monthly" if count == 3 => Frequency::Quarterly,
            "month" | "monthly" if count == 6 => Frequency::Biannually,
            "month" | "monthly" if count == 12 => Frequency::Yearly,
            "quarter" | "quarterly" => Frequency::Quarterly,
            "year" | "yearly" => Frequency::Yearly,
            "biannual" | "biannually" => Frequency::Biannually,
            _ => Frequency::Monthly,
        }
    }
}

/// A subscription on the CRM side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmRecurringDonation {
    pub id: Option<String>,
    pub account_id: Option<String>,
    pub contact_id: Option<String>,
    pub gateway_name: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub frequency: Frequency,
    pub description: Option<String>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_date: Option<OffsetDateTime>,
}
