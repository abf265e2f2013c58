//! Local mirror of billing-provider subscriptions.
//!
//! The provider is the source of truth for subscription status; the local
//! row is a cache keyed by the provider's subscription id and is upserted on
//! every lifecycle event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// A subscription mirrored from the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Provider subscription id (unique key).
    pub stripe_subscription_id: String,

    /// Owning user.
    pub user_id: UserId,

    /// Price id of the first subscription item.
    pub stripe_price_id: Option<String>,

    /// Provider status.
    pub status: SubscriptionStatus,

    /// Start of the current billing period.
    pub current_period_start: DateTime<Utc>,

    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,

    /// Whether the subscription ends at the period boundary.
    pub cancel_at_period_end: bool,

    /// When the mirror row was last written.
    pub updated_at: DateTime<Utc>,
}

/// Provider subscription status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    /// Paid and current.
    Active,
    /// In a trial period.
    Trialing,
    /// Latest invoice unpaid, provider still retrying.
    PastDue,
    /// Ended.
    Canceled,
    /// Retries exhausted without payment.
    Unpaid,
    /// Awaiting first payment.
    Incomplete,
    /// First payment never completed.
    IncompleteExpired,
    /// Collection paused.
    Paused,
    /// A status this service does not know.
    Other(String),
}

/// Effect of a subscription status on the user's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    /// The user is entitled to the subscribed plan.
    Entitled,
    /// The user reverts to the basic plan.
    Revoked,
    /// No entitlement change.
    Unchanged,
}

impl SubscriptionStatus {
    /// Provider name of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Other(name) => name,
        }
    }

    /// Entitlement implied by this status.
    #[must_use]
    pub const fn entitlement(&self) -> Entitlement {
        match self {
            Self::Active | Self::Trialing => Entitlement::Entitled,
            Self::Canceled | Self::Unpaid => Entitlement::Revoked,
            _ => Entitlement::Unchanged,
        }
    }
}

impl From<String> for SubscriptionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<SubscriptionStatus> for String {
    fn from(status: SubscriptionStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_state_machine() {
        assert_eq!(SubscriptionStatus::Active.entitlement(), Entitlement::Entitled);
        assert_eq!(SubscriptionStatus::Trialing.entitlement(), Entitlement::Entitled);
        assert_eq!(SubscriptionStatus::Canceled.entitlement(), Entitlement::Revoked);
        assert_eq!(SubscriptionStatus::Unpaid.entitlement(), Entitlement::Revoked);
        assert_eq!(SubscriptionStatus::PastDue.entitlement(), Entitlement::Unchanged);
        assert_eq!(SubscriptionStatus::Paused.entitlement(), Entitlement::Unchanged);
        assert_eq!(
            SubscriptionStatus::from("something_new").entitlement(),
            Entitlement::Unchanged
        );
    }

    #[test]
    fn unknown_status_is_preserved() {
        let status = SubscriptionStatus::from("something_new");
        assert_eq!(status, SubscriptionStatus::Other("something_new".into()));
        assert_eq!(String::from(status), "something_new");
    }

    #[test]
    fn status_serde_uses_provider_names() {
        let json = serde_json::to_string(&SubscriptionStatus::PastDue).unwrap();
        assert_eq!(json, "\"past_due\"");
        let parsed: SubscriptionStatus = serde_json::from_str("\"trialing\"").unwrap();
        assert_eq!(parsed, SubscriptionStatus::Trialing);
    }
}
