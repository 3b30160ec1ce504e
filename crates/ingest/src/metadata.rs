//! Metadata resolution
//!
//! Gateway objects carry free-form key/value metadata written by whatever
//! donation form or integration created them. Different integrations use
//! different key names for the same concept, so every lookup here is
//! case-insensitive and several lookups are pattern based.
//!
//! Metadata from each object is kept in its own tier. [`MetadataTiers`] holds
//! them in a fixed order and never merges them in place:
//!
//! - explicit configured keys (account id, campaign id, ...) resolve in
//!   precedence order: donation, recurring donation, contact, account
//! - identity patterns (names, email, address) resolve account-first, since
//!   the customer is the authoritative source for who the donor is and the
//!   charge/subscription only backs it up

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Case-insensitive string map attached to a gateway object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = Option::<BTreeMap<String, String>>::deserialize(deserializer)?;
        Ok(Metadata(map.unwrap_or_default()))
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key ignoring ASCII case. An exact match wins over a
    /// case-folded one.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.0.get(key) {
            return Some(value.as_str());
        }
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty, trimmed value for a key
    pub fn value(&self, key: &str) -> Option<String> {
        self.get(key).and_then(clean)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Values are pasted into donation forms by humans and regularly carry stray
/// whitespace (including NBSP). Empty values count as absent.
fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Per-organization names of metadata keys carrying CRM identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataKeys {
    pub account: Vec<String>,
    pub contact: Vec<String>,
    pub campaign: Vec<String>,
    pub record_type: Vec<String>,
    pub fund: Vec<String>,
}

impl MetadataKeys {
    /// Parse a comma-separated list of key names, dropping blanks
    pub fn parse_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataTier {
    Donation,
    RecurringDonation,
    Contact,
    Account,
}

/// Immutable, precedence-ordered set of metadata maps for one event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataTiers {
    donation: Metadata,
    recurring_donation: Metadata,
    contact: Metadata,
    account: Metadata,
}

impl MetadataTiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_donation(mut self, metadata: Metadata) -> Self {
        self.donation = metadata;
        self
    }

    pub fn with_recurring_donation(mut self, metadata: Metadata) -> Self {
        self.recurring_donation = metadata;
        self
    }

    pub fn with_contact(mut self, metadata: Metadata) -> Self {
        self.contact = metadata;
        self
    }

    pub fn with_account(mut self, metadata: Metadata) -> Self {
        self.account = metadata;
        self
    }

    pub fn tier(&self, tier: MetadataTier) -> &Metadata {
        match tier {
            MetadataTier::Donation => &self.donation,
            MetadataTier::RecurringDonation => &self.recurring_donation,
            MetadataTier::Contact => &self.contact,
            MetadataTier::Account => &self.account,
        }
    }

    /// Tiers in the order explicit keys are resolved
    pub fn precedence(&self) -> [(MetadataTier, &Metadata); 4] {
        [
            (MetadataTier::Donation, &self.donation),
            (MetadataTier::RecurringDonation, &self.recurring_donation),
            (MetadataTier::Contact, &self.contact),
            (MetadataTier::Account, &self.account),
        ]
    }

    /// Tiers in the order identity patterns are resolved
    pub fn identity_order(&self) -> [(MetadataTier, &Metadata); 4] {
        [
            (MetadataTier::Account, &self.account),
            (MetadataTier::Contact, &self.contact),
            (MetadataTier::Donation, &self.donation),
            (MetadataTier::RecurringDonation, &self.recurring_donation),
        ]
    }

    /// First non-empty value for any of `keys`, walking tiers in precedence
    /// order. Within a tier, keys are tried in the order given.
    pub fn value<S: AsRef<str>>(&self, keys: &[S]) -> Option<String> {
        self.precedence().iter().find_map(|(_, metadata)| {
            keys.iter()
                .map(AsRef::as_ref)
                .filter(|k| !k.is_empty())
                .find_map(|k| metadata.value(k))
        })
    }
}

/// Donor identity fields that can be backfilled from metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    FullName,
    FirstName,
    LastName,
    Email,
    Phone,
    Street,
    City,
    State,
    PostalCode,
    Country,
    EmailOptIn,
    EmailOptOut,
}

/// Key matcher for one identity field. Matchers receive the lowercased key.
#[derive(Clone, Copy)]
pub struct KeyRule {
    pub field: IdentityField,
    pub matches: fn(&str) -> bool,
}

impl std::fmt::Debug for KeyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRule").field("field", &self.field).finish()
    }
}

// Anchored on purpose: "fundraiser_first_name" must not be taken as the donor's.
#[allow(clippy::unwrap_used)] // literal pattern
static FIRST_NAME_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^first.*name$").unwrap());
#[allow(clippy::unwrap_used)] // literal pattern
static LAST_NAME_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^last.*name$").unwrap());

fn is_full_name_key(key: &str) -> bool {
    (key.contains("customer") || key.contains("full")) && key.contains("name")
}

fn is_first_name_key(key: &str) -> bool {
    FIRST_NAME_KEY.is_match(key)
}

fn is_last_name_key(key: &str) -> bool {
    LAST_NAME_KEY.is_match(key)
}

fn is_opt_key(key: &str) -> bool {
    key.contains("opt") || key.contains("subscribe")
}

fn is_email_key(key: &str) -> bool {
    key.contains("email") && !is_opt_key(key)
}

fn is_phone_key(key: &str) -> bool {
    key.contains("phone")
}

fn is_street_key(key: &str) -> bool {
    (key.contains("street") || key.contains("address")) && !key.contains("email")
}

fn is_city_key(key: &str) -> bool {
    key.contains("city")
}

fn is_state_key(key: &str) -> bool {
    key.contains("state")
}

fn is_postal_key(key: &str) -> bool {
    key.contains("postal") || key.contains("zip")
}

fn is_country_key(key: &str) -> bool {
    key.contains("country")
}

fn is_opt_in_key(key: &str) -> bool {
    key.contains("opt") && key.contains("in") && !key.contains("out")
}

fn is_opt_out_key(key: &str) -> bool {
    (key.contains("opt") && key.contains("out")) || key.contains("unsubscribe")
}

/// Identity backfill rules. Evaluated once per tier; the first tier (in
/// identity order) and first key to match a field wins that field.
pub static IDENTITY_RULES: &[KeyRule] = &[
    KeyRule { field: IdentityField::FullName, matches: is_full_name_key },
    KeyRule { field: IdentityField::FirstName, matches: is_first_name_key },
    KeyRule { field: IdentityField::LastName, matches: is_last_name_key },
    KeyRule { field: IdentityField::Email, matches: is_email_key },
    KeyRule { field: IdentityField::Phone, matches: is_phone_key },
    KeyRule { field: IdentityField::Street, matches: is_street_key },
    KeyRule { field: IdentityField::City, matches: is_city_key },
    KeyRule { field: IdentityField::State, matches: is_state_key },
    KeyRule { field: IdentityField::PostalCode, matches: is_postal_key },
    KeyRule { field: IdentityField::Country, matches: is_country_key },
    KeyRule { field: IdentityField::EmailOptIn, matches: is_opt_in_key },
    KeyRule { field: IdentityField::EmailOptOut, matches: is_opt_out_key },
];

/// Result of running [`IDENTITY_RULES`] over a set of tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub email_opt_in: Option<String>,
    pub email_opt_out: Option<String>,
}

impl ResolvedIdentity {
    fn slot(&mut self, field: IdentityField) -> &mut Option<String> {
        match field {
            IdentityField::FullName => &mut self.full_name,
            IdentityField::FirstName => &mut self.first_name,
            IdentityField::LastName => &mut self.last_name,
            IdentityField::Email => &mut self.email,
            IdentityField::Phone => &mut self.phone,
            IdentityField::Street => &mut self.street,
            IdentityField::City => &mut self.city,
            IdentityField::State => &mut self.state,
            IdentityField::PostalCode => &mut self.postal_code,
            IdentityField::Country => &mut self.country,
            IdentityField::EmailOptIn => &mut self.email_opt_in,
            IdentityField::EmailOptOut => &mut self.email_opt_out,
        }
    }

    pub fn get(&self, field: IdentityField) -> Option<&str> {
        match field {
            IdentityField::FullName => self.full_name.as_deref(),
            IdentityField::FirstName => self.first_name.as_deref(),
            IdentityField::LastName => self.last_name.as_deref(),
            IdentityField::Email => self.email.as_deref(),
            IdentityField::Phone => self.phone.as_deref(),
            IdentityField::Street => self.street.as_deref(),
            IdentityField::City => self.city.as_deref(),
            IdentityField::State => self.state.as_deref(),
            IdentityField::PostalCode => self.postal_code.as_deref(),
            IdentityField::Country => self.country.as_deref(),
            IdentityField::EmailOptIn => self.email_opt_in.as_deref(),
            IdentityField::EmailOptOut => self.email_opt_out.as_deref(),
        }
    }
}

/// Apply `rules` to every tier, account-first
pub fn resolve_identity(tiers: &MetadataTiers, rules: &[KeyRule]) -> ResolvedIdentity {
    let mut resolved = ResolvedIdentity::default();
    for (_, metadata) in tiers.identity_order() {
        for (key, value) in metadata.iter() {
            let Some(value) = clean(value) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            for rule in rules {
                let slot = resolved.slot(rule.field);
                if slot.is_none() && (rule.matches)(&key) {
                    *slot = Some(value.clone());
                }
            }
        }
    }
    resolved
}

/// Interpret a metadata flag ("true", "yes", "1", ...)
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}
