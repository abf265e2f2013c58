//! Stripe webhook payload types.
//!
//! Only the fields the ledger reacts to are modelled; everything else in the
//! payload is ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tarot_billing_core::{
    BillingEvent, CheckoutCompletion, EventPayload, InvoicePayment, SubscriptionSnapshot,
};

/// Stripe webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Created timestamp (Unix).
    #[serde(default)]
    pub created: i64,
}

/// Webhook event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The event object.
    pub object: serde_json::Value,
}

/// A reference that Stripe sends either as an id or as the expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    /// Bare id.
    Id(String),
    /// Expanded object.
    Object {
        /// Object id.
        id: String,
    },
}

impl Expandable {
    /// The referenced id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }

    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

/// Stripe list wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    /// Data items.
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

/// Stripe price (only its id matters).
#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    /// Price ID.
    pub id: String,
}

/// Stripe subscription object.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    /// Subscription ID.
    pub id: String,
    /// Customer.
    pub customer: Expandable,
    /// Status.
    pub status: String,
    /// Subscription items.
    #[serde(default)]
    pub items: StripeList<SubscriptionItem>,
    /// Current period start (Unix).
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Current period end (Unix).
    #[serde(default)]
    pub current_period_end: Option<i64>,
    /// Whether it cancels at period end.
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// Stripe subscription item.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    /// Item price.
    #[serde(default)]
    pub price: Option<Price>,
    /// Item-level period start (newer API versions).
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Item-level period end (newer API versions).
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

/// Stripe Checkout session object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    /// Session ID.
    pub id: String,
    /// Customer.
    #[serde(default)]
    pub customer: Option<Expandable>,
    /// Metadata set when the session was created (`userId`, `plan`).
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// Stripe invoice object.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    /// Invoice ID.
    pub id: String,
    /// Subscription.
    #[serde(default)]
    pub subscription: Option<Expandable>,
    /// Customer.
    #[serde(default)]
    pub customer: Option<Expandable>,
    /// Billing reason.
    #[serde(default)]
    pub billing_reason: Option<String>,
    /// Line items.
    #[serde(default)]
    pub lines: StripeList<InvoiceLine>,
}

/// Stripe invoice line item.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    /// Line price.
    #[serde(default)]
    pub price: Option<Price>,
}

/// Any object, when only its id is logged.
#[derive(Debug, Clone, Deserialize)]
struct ObjectRef {
    #[serde(default)]
    id: Option<String>,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was received.
    pub received: bool,
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl From<SubscriptionObject> for SubscriptionSnapshot {
    fn from(sub: SubscriptionObject) -> Self {
        let first_item = sub.items.data.into_iter().next();
        let (price_id, item_start, item_end) = first_item.map_or((None, None, None), |item| {
            (
                item.price.map(|p| p.id),
                item.current_period_start,
                item.current_period_end,
            )
        });

        Self {
            subscription_id: sub.id,
            customer_id: sub.customer.into_id(),
            status: sub.status.into(),
            price_id,
            current_period_start: timestamp(sub.current_period_start.or(item_start)),
            current_period_end: timestamp(sub.current_period_end.or(item_end)),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

impl From<CheckoutSessionObject> for CheckoutCompletion {
    fn from(session: CheckoutSessionObject) -> Self {
        let mut metadata = session.metadata.unwrap_or_default();
        Self {
            session_id: session.id,
            customer_id: session.customer.map(Expandable::into_id),
            user_id: metadata.remove("userId"),
            plan: metadata.remove("plan"),
        }
    }
}

impl From<InvoiceObject> for InvoicePayment {
    fn from(invoice: InvoiceObject) -> Self {
        Self {
            invoice_id: invoice.id,
            subscription_id: invoice.subscription.map(Expandable::into_id),
            customer_id: invoice.customer.map(Expandable::into_id),
            billing_reason: invoice.billing_reason,
            price_id: invoice
                .lines
                .data
                .into_iter()
                .next()
                .and_then(|line| line.price)
                .map(|p| p.id),
        }
    }
}

impl WebhookEvent {
    /// Decode the event object according to the event type.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not have the shape its event type
    /// requires.
    pub fn into_billing_event(self) -> Result<BillingEvent, serde_json::Error> {
        let object = self.data.object;
        let object_id = || -> Result<Option<String>, serde_json::Error> {
            Ok(serde_json::from_value::<ObjectRef>(object.clone())?.id)
        };

        let payload = match self.event_type.as_str() {
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted"
            | "customer.subscription.paused"
            | "customer.subscription.resumed"
            | "customer.subscription.pending_update_applied"
            | "customer.subscription.pending_update_expired" => EventPayload::SubscriptionChanged(
                serde_json::from_value::<SubscriptionObject>(object)?.into(),
            ),
            "checkout.session.completed" => EventPayload::CheckoutCompleted(
                serde_json::from_value::<CheckoutSessionObject>(object)?.into(),
            ),
            "invoice.paid" => {
                EventPayload::InvoicePaid(serde_json::from_value::<InvoiceObject>(object)?.into())
            }
            "invoice.payment_failed" => EventPayload::InvoicePaymentFailed {
                invoice_id: object_id()?.unwrap_or_default(),
            },
            "invoice.payment_action_required" | "invoice.upcoming" => {
                EventPayload::InvoiceNotice {
                    invoice_id: object_id()?,
                }
            }
            "charge.refunded" => EventPayload::ChargeRefunded {
                charge_id: object_id()?.unwrap_or_default(),
            },
            "charge.dispute.created" | "charge.dispute.closed" => EventPayload::Dispute {
                dispute_id: object_id()?.unwrap_or_default(),
            },
            "customer.created" | "customer.updated" => EventPayload::CustomerChanged {
                customer_id: object_id()?.unwrap_or_default(),
            },
            "customer.deleted" => EventPayload::CustomerDeleted {
                customer_id: object_id()?.unwrap_or_default(),
            },
            _ => EventPayload::Unhandled,
        };

        Ok(BillingEvent {
            id: self.id,
            event_type: self.event_type,
            created: DateTime::from_timestamp(self.created, 0).unwrap_or_else(Utc::now),
            payload,
        })
    }
}
