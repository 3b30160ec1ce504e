//! Per-organization ingestion settings

use serde::{Deserialize, Serialize};

use crate::metadata::MetadataKeys;

/// Settings the normalizer needs to interpret gateway objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Organization settlement currency, upper-case ISO code
    pub currency: String,
    pub metadata_keys: MetadataKeys,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            metadata_keys: MetadataKeys::default(),
        }
    }
}

impl IngestConfig {
    pub fn new(currency: impl Into<String>, metadata_keys: MetadataKeys) -> Self {
        Self {
            currency: currency.into().trim().to_ascii_uppercase(),
            metadata_keys,
        }
    }

    /// Load from `ORG_CURRENCY` and `METADATA_KEYS_*`
    pub fn from_env() -> Self {
        let list = |name: &str| {
            std::env::var(name)
                .map(|raw| MetadataKeys::parse_list(&raw))
                .unwrap_or_default()
        };

        let currency = std::env::var("ORG_CURRENCY")
            .ok()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "USD".to_string());

        Self::new(
            currency,
            MetadataKeys {
                account: list("METADATA_KEYS_ACCOUNT"),
                contact: list("METADATA_KEYS_CONTACT"),
                campaign: list("METADATA_KEYS_CAMPAIGN"),
                record_type: list("METADATA_KEYS_RECORD_TYPE"),
                fund: list("METADATA_KEYS_FUND"),
            },
        )
    }

    /// Whether `currency` (any case) is the organization's own
    pub fn is_org_currency(&self, currency: &str) -> bool {
        self.currency.eq_ignore_ascii_case(currency.trim())
    }
}
