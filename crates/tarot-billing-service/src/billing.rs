//! Billing event processing.
//!
//! Maps verified provider events onto entitlement changes. Every change is
//! handed to [`Store::apply_entitlement`] together with the event id, so a
//! redelivered event is a no-op.

use chrono::Utc;

use tarot_billing_core::{
    BillingEvent, CheckoutCompletion, Entitlement, EntitlementChange, EventPayload,
    InvoicePayment, Plan, PlanCatalog, PlanResolution, SubscriptionSnapshot, User,
};
use tarot_billing_store::{EntitlementOutcome, Store, StoreError};

/// What happened to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The user's plan or balance changed.
    Applied,
    /// The event was relevant but changed nothing.
    Unchanged,
    /// The event id was already processed.
    Duplicate,
    /// The event was dropped before reaching the ledger.
    Skipped(&'static str),
    /// The event type is only logged.
    Logged,
}

/// Applies billing events to the store.
pub struct BillingEventProcessor<'a> {
    store: &'a dyn Store,
    plans: &'a PlanCatalog,
}

impl<'a> BillingEventProcessor<'a> {
    /// Create a processor over `store`, resolving prices with `plans`.
    #[must_use]
    pub fn new(store: &'a dyn Store, plans: &'a PlanCatalog) -> Self {
        Self { store, plans }
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Returns a store error if persistence fails; the provider should then
    /// redeliver.
    pub async fn process(&self, event: &BillingEvent) -> Result<Disposition, StoreError> {
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            kind = event.payload.kind(),
            created = %event.created,
            age_seconds = event.age(Utc::now()).num_seconds(),
            "Processing billing event"
        );

        match &event.payload {
            EventPayload::SubscriptionChanged(snapshot) => {
                self.subscription_changed(event, snapshot).await
            }
            EventPayload::CheckoutCompleted(checkout) => {
                self.checkout_completed(event, checkout).await
            }
            EventPayload::InvoicePaid(invoice) => self.invoice_paid(event, invoice).await,
            EventPayload::CustomerDeleted { customer_id } => {
                let Some(user) = self.user_for_customer(event, customer_id).await? else {
                    return Ok(Disposition::Skipped("unknown customer"));
                };
                self.apply(event, &user, &EntitlementChange::DetachCustomer)
                    .await
            }
            EventPayload::InvoicePaymentFailed { invoice_id } => {
                tracing::warn!(event_id = %event.id, invoice_id = %invoice_id, "Invoice payment failed");
                Ok(Disposition::Logged)
            }
            EventPayload::InvoiceNotice { invoice_id } => {
                tracing::info!(event_id = %event.id, event_type = %event.event_type, invoice_id = ?invoice_id, "Invoice notice");
                Ok(Disposition::Logged)
            }
            EventPayload::ChargeRefunded { charge_id } => {
                tracing::warn!(event_id = %event.id, charge_id = %charge_id, "Charge refunded; credits not clawed back");
                Ok(Disposition::Logged)
            }
            EventPayload::Dispute { dispute_id } => {
                tracing::warn!(event_id = %event.id, event_type = %event.event_type, dispute_id = %dispute_id, "Charge dispute");
                Ok(Disposition::Logged)
            }
            EventPayload::CustomerChanged { customer_id } => {
                tracing::info!(event_id = %event.id, event_type = %event.event_type, customer_id = %customer_id, "Customer changed");
                Ok(Disposition::Logged)
            }
            EventPayload::Unhandled => {
                tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Unhandled webhook event type");
                Ok(Disposition::Logged)
            }
        }
    }

    async fn subscription_changed(
        &self,
        event: &BillingEvent,
        snapshot: &SubscriptionSnapshot,
    ) -> Result<Disposition, StoreError> {
        let Some(user) = self.user_for_customer(event, &snapshot.customer_id).await? else {
            return Ok(Disposition::Skipped("unknown customer"));
        };

        if snapshot.period_defaulted() {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %snapshot.subscription_id,
                "Subscription period missing; defaulting to now + 30 days"
            );
        }

        self.store
            .upsert_subscription(&snapshot.to_subscription(user.id, Utc::now()))
            .await?;

        let change = match snapshot.status.entitlement() {
            Entitlement::Entitled => EntitlementChange::SwitchPlan {
                plan: self.resolve_plan(event, snapshot.price_id.as_deref()),
            },
            Entitlement::Revoked => EntitlementChange::RevertToBasic,
            Entitlement::Unchanged => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user.id,
                    status = %snapshot.status,
                    "Subscription status does not change entitlement"
                );
                return Ok(Disposition::Unchanged);
            }
        };

        self.apply(event, &user, &change).await
    }

    async fn checkout_completed(
        &self,
        event: &BillingEvent,
        checkout: &CheckoutCompletion,
    ) -> Result<Disposition, StoreError> {
        let (user_id, plan) = match (checkout.user(), checkout.purchased_plan()) {
            (Ok(user_id), Ok(plan)) => (user_id, plan),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(
                    event_id = %event.id,
                    session_id = %checkout.session_id,
                    error = %e,
                    "Dropping checkout with unusable metadata"
                );
                return Ok(Disposition::Skipped("invalid metadata"));
            }
        };

        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::warn!(event_id = %event.id, user_id = %user_id, "Checkout for unknown user");
            return Ok(Disposition::Skipped("unknown user"));
        };

        let change = EntitlementChange::Purchase {
            plan,
            customer_id: checkout.customer_id.clone(),
        };
        self.apply(event, &user, &change).await
    }

    async fn invoice_paid(
        &self,
        event: &BillingEvent,
        invoice: &InvoicePayment,
    ) -> Result<Disposition, StoreError> {
        if let Some(reason) = invoice.skip_reason() {
            tracing::debug!(
                event_id = %event.id,
                invoice_id = %invoice.invoice_id,
                reason,
                "Invoice is not a renewal"
            );
            return Ok(Disposition::Skipped(reason));
        }

        let Some(customer_id) = invoice.customer_id.as_deref() else {
            return Ok(Disposition::Skipped("no customer"));
        };
        let Some(user) = self.user_for_customer(event, customer_id).await? else {
            return Ok(Disposition::Skipped("unknown customer"));
        };

        let change = EntitlementChange::Renew {
            plan: self.resolve_plan(event, invoice.price_id.as_deref()),
        };
        self.apply(event, &user, &change).await
    }

    async fn apply(
        &self,
        event: &BillingEvent,
        user: &User,
        change: &EntitlementChange,
    ) -> Result<Disposition, StoreError> {
        let outcome = self
            .store
            .apply_entitlement(&event.id, &event.event_type, user.id, change)
            .await?;

        Ok(match outcome {
            EntitlementOutcome::Applied { user, transaction } => {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user.id,
                    plan = %user.plan.as_str(),
                    granted = transaction.as_ref().map_or(0, |tx| tx.amount),
                    balance = user.credit_balance,
                    "Entitlement applied"
                );
                Disposition::Applied
            }
            EntitlementOutcome::Unchanged => {
                tracing::debug!(event_id = %event.id, user_id = %user.id, "Entitlement already current");
                Disposition::Unchanged
            }
            EntitlementOutcome::Duplicate => {
                tracing::info!(event_id = %event.id, "Duplicate billing event ignored");
                Disposition::Duplicate
            }
        })
    }

    async fn user_for_customer(
        &self,
        event: &BillingEvent,
        customer_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let user = self.store.find_user_by_customer(customer_id).await?;
        if user.is_none() {
            tracing::warn!(
                event_id = %event.id,
                customer_id = %customer_id,
                "No user linked to customer"
            );
        }
        Ok(user)
    }

    fn resolve_plan(&self, event: &BillingEvent, price_id: Option<&str>) -> Plan {
        let resolution = self.plans.resolve(price_id);
        if resolution == PlanResolution::Unmatched {
            tracing::warn!(
                event_id = %event.id,
                price_id = ?price_id,
                "Price id matches no plan; treating as basic"
            );
        }
        resolution.plan()
    }
}
