//! Recurring donation creation rules for `customer.subscription.created`
//!
//! A live subscription fires its first charge almost immediately, and the
//! charge path creates the recurring donation itself. If this event also
//! created one, two independently delivered webhooks would race to insert the
//! same subscription. Only trialing subscriptions are created here, since
//! their first charge is still in the future.

use serde::Serialize;

use crate::gateway::Subscription;

/// Metadata flag set on subscriptions moved over from another platform
pub const AUTO_MIGRATED_KEY: &str = "auto-migrated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionDecision {
    /// Migration already created the recurring donation
    SkipAutoMigrated,
    /// Trialing: no charge is coming soon, so create it from this event
    CreateNow,
    /// Live: the first successful charge creates it
    DeferToFirstCharge,
}

impl SubscriptionDecision {
    pub fn evaluate(subscription: &Subscription) -> Self {
        let migrated = subscription
            .metadata
            .value(AUTO_MIGRATED_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if migrated {
            SubscriptionDecision::SkipAutoMigrated
        } else if subscription.is_trialing() {
            SubscriptionDecision::CreateNow
        } else {
            SubscriptionDecision::DeferToFirstCharge
        }
    }

    pub fn creates(self) -> bool {
        matches!(self, SubscriptionDecision::CreateNow)
    }

    pub fn reason(self) -> &'static str {
        match self {
            SubscriptionDecision::SkipAutoMigrated => "subscription was auto-migrated",
            SubscriptionDecision::CreateNow => "subscription is trialing",
            SubscriptionDecision::DeferToFirstCharge => {
                "subscription is live, first charge creates the recurring donation"
            }
        }
    }
}
