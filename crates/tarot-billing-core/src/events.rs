//! Billing events.
//!
//! Provider webhooks are decoded (and their signatures verified) at the HTTP
//! edge, then converted into a [`BillingEvent`]: a provider-neutral tagged
//! union carrying only the fields the ledger reacts to.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{BillingError, Plan, Result, Subscription, SubscriptionStatus, UserId};

/// Period length assumed when the provider omits the period end.
pub const DEFAULT_PERIOD_DAYS: i64 = 30;

/// Invoice billing reasons that belong to checkout, not renewal.
pub const NON_RENEWAL_BILLING_REASONS: [&str; 2] = ["subscription_create", "subscription_update"];

/// A verified billing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingEvent {
    /// Provider event id; the idempotency key.
    pub id: String,

    /// Provider event type (e.g. `invoice.paid`).
    pub event_type: String,

    /// When the provider created the event.
    pub created: DateTime<Utc>,

    /// Decoded payload.
    pub payload: EventPayload,
}

impl BillingEvent {
    /// Time between the provider creating the event and `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created
    }
}

/// Payload of a [`BillingEvent`], by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// A subscription was created, updated, deleted, paused or resumed.
    SubscriptionChanged(SubscriptionSnapshot),

    /// A checkout session completed.
    CheckoutCompleted(CheckoutCompletion),

    /// An invoice was paid.
    InvoicePaid(InvoicePayment),

    /// An invoice payment failed.
    InvoicePaymentFailed {
        /// Invoice id.
        invoice_id: String,
    },

    /// Informational invoice notice (action required, upcoming).
    InvoiceNotice {
        /// Invoice id, when present.
        invoice_id: Option<String>,
    },

    /// A charge was refunded.
    ChargeRefunded {
        /// Charge id.
        charge_id: String,
    },

    /// A dispute was opened or closed.
    Dispute {
        /// Dispute id.
        dispute_id: String,
    },

    /// A customer was created or updated.
    CustomerChanged {
        /// Customer id.
        customer_id: String,
    },

    /// A customer was deleted.
    CustomerDeleted {
        /// Customer id.
        customer_id: String,
    },

    /// An event type this service does not handle.
    Unhandled,
}

impl EventPayload {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionChanged(_) => "subscription_changed",
            Self::CheckoutCompleted(_) => "checkout_completed",
            Self::InvoicePaid(_) => "invoice_paid",
            Self::InvoicePaymentFailed { .. } => "invoice_payment_failed",
            Self::InvoiceNotice { .. } => "invoice_notice",
            Self::ChargeRefunded { .. } => "charge_refunded",
            Self::Dispute { .. } => "dispute",
            Self::CustomerChanged { .. } => "customer_changed",
            Self::CustomerDeleted { .. } => "customer_deleted",
            Self::Unhandled => "unhandled",
        }
    }
}

/// Subscription state carried by a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Provider subscription id.
    pub subscription_id: String,

    /// Provider customer id.
    pub customer_id: String,

    /// Provider status.
    pub status: SubscriptionStatus,

    /// Price id of the first subscription item.
    pub price_id: Option<String>,

    /// Start of the current period, if the provider sent it.
    pub current_period_start: Option<DateTime<Utc>>,

    /// End of the current period, if the provider sent it.
    pub current_period_end: Option<DateTime<Utc>>,

    /// Whether the subscription ends at the period boundary.
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    /// Whether either period bound is missing and will be defaulted.
    #[must_use]
    pub const fn period_defaulted(&self) -> bool {
        self.current_period_start.is_none() || self.current_period_end.is_none()
    }

    /// Local mirror row for `user_id`.
    ///
    /// A missing period start defaults to `now`, a missing end to
    /// `now + DEFAULT_PERIOD_DAYS`.
    #[must_use]
    pub fn to_subscription(&self, user_id: UserId, now: DateTime<Utc>) -> Subscription {
        Subscription {
            stripe_subscription_id: self.subscription_id.clone(),
            user_id,
            stripe_price_id: self.price_id.clone(),
            status: self.status.clone(),
            current_period_start: self.current_period_start.unwrap_or(now),
            current_period_end: self
                .current_period_end
                .unwrap_or_else(|| now + Duration::days(DEFAULT_PERIOD_DAYS)),
            cancel_at_period_end: self.cancel_at_period_end,
            updated_at: now,
        }
    }
}

/// A completed checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompletion {
    /// Checkout session id.
    pub session_id: String,

    /// Provider customer created or reused by the checkout.
    pub customer_id: Option<String>,

    /// Raw `userId` metadata.
    pub user_id: Option<String>,

    /// Raw `plan` metadata.
    pub plan: Option<String>,
}

impl CheckoutCompletion {
    /// The purchasing user from metadata.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::MalformedEvent` if `userId` is missing or not a
    /// positive integer.
    pub fn user(&self) -> Result<UserId> {
        let raw = self
            .user_id
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("missing userId metadata".into()))?;
        raw.parse()
            .map_err(|_| BillingError::MalformedEvent(format!("invalid userId metadata: {raw}")))
    }

    /// The purchased plan from metadata.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::MalformedEvent` if `plan` is missing, or
    /// `BillingError::UnrecognizedPlan` if it names no known plan.
    pub fn purchased_plan(&self) -> Result<Plan> {
        let raw = self
            .plan
            .as_deref()
            .ok_or_else(|| BillingError::MalformedEvent("missing plan metadata".into()))?;
        Plan::from_name(raw).ok_or_else(|| BillingError::UnrecognizedPlan(raw.to_string()))
    }
}

/// A paid invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePayment {
    /// Invoice id.
    pub invoice_id: String,

    /// Subscription the invoice belongs to.
    pub subscription_id: Option<String>,

    /// Provider customer id.
    pub customer_id: Option<String>,

    /// Why the invoice was issued (e.g. `subscription_cycle`).
    pub billing_reason: Option<String>,

    /// Price id of the first line item.
    pub price_id: Option<String>,
}

impl InvoicePayment {
    /// Why this invoice is not a renewal, or `None` if it is one.
    #[must_use]
    pub fn skip_reason(&self) -> Option<&'static str> {
        if self.subscription_id.is_none() {
            return Some("no subscription");
        }
        if self
            .billing_reason
            .as_deref()
            .is_some_and(|reason| NON_RENEWAL_BILLING_REASONS.contains(&reason))
        {
            return Some("handled by checkout");
        }
        if self.customer_id.is_none() {
            return Some("no customer");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_id: "sub_1".into(),
            customer_id: "cus_1".into(),
            status: SubscriptionStatus::Active,
            price_id: Some("price_pro".into()),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    fn invoice(reason: Option<&str>) -> InvoicePayment {
        InvoicePayment {
            invoice_id: "in_1".into(),
            subscription_id: Some("sub_1".into()),
            customer_id: Some("cus_1".into()),
            billing_reason: reason.map(str::to_string),
            price_id: Some("price_pro".into()),
        }
    }

    #[test]
    fn missing_periods_default_to_now_and_thirty_days() {
        let now = Utc::now();
        let snapshot = snapshot();
        assert!(snapshot.period_defaulted());

        let sub = snapshot.to_subscription(UserId::new(7), now);
        assert_eq!(sub.current_period_start, now);
        assert_eq!(sub.current_period_end, now + Duration::days(30));
        assert_eq!(sub.user_id, UserId::new(7));
    }

    #[test]
    fn present_periods_are_kept() {
        let now = Utc::now();
        let start = now - Duration::days(2);
        let end = now + Duration::days(5);
        let snapshot = SubscriptionSnapshot {
            current_period_start: Some(start),
            current_period_end: Some(end),
            ..snapshot()
        };
        assert!(!snapshot.period_defaulted());

        let sub = snapshot.to_subscription(UserId::new(7), now);
        assert_eq!(sub.current_period_start, start);
        assert_eq!(sub.current_period_end, end);
    }

    #[test]
    fn checkout_metadata_is_validated() {
        let mut checkout = CheckoutCompletion {
            session_id: "cs_1".into(),
            customer_id: Some("cus_1".into()),
            user_id: Some("42".into()),
            plan: Some("pro".into()),
        };
        assert_eq!(checkout.user().unwrap(), UserId::new(42));
        assert_eq!(checkout.purchased_plan().unwrap(), Plan::Pro);

        checkout.user_id = Some("abc".into());
        assert!(matches!(checkout.user(), Err(BillingError::MalformedEvent(_))));

        checkout.plan = Some("gold".into());
        assert_eq!(
            checkout.purchased_plan(),
            Err(BillingError::UnrecognizedPlan("gold".into()))
        );

        checkout.plan = None;
        assert!(matches!(
            checkout.purchased_plan(),
            Err(BillingError::MalformedEvent(_))
        ));
    }

    #[test]
    fn only_cycle_invoices_are_renewals() {
        assert_eq!(invoice(Some("subscription_cycle")).skip_reason(), None);
        assert_eq!(invoice(None).skip_reason(), None);
        assert!(invoice(Some("subscription_create")).skip_reason().is_some());
        assert!(invoice(Some("subscription_update")).skip_reason().is_some());

        let mut no_sub = invoice(None);
        no_sub.subscription_id = None;
        assert_eq!(no_sub.skip_reason(), Some("no subscription"));

        let mut no_customer = invoice(None);
        no_customer.customer_id = None;
        assert_eq!(no_customer.skip_reason(), Some("no customer"));
    }

    #[test]
    fn event_age_is_measured_from_creation() {
        let created = Utc::now();
        let event = BillingEvent {
            id: "evt_1".into(),
            event_type: "invoice.paid".into(),
            created,
            payload: EventPayload::Unhandled,
        };
        assert_eq!(event.age(created + Duration::seconds(90)).num_seconds(), 90);
    }
}
