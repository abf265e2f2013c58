//! Credit ledger operations.
//!
//! These are pure mutations of a [`User`]. Stores call them while holding
//! the user's row lock and persist the resulting row together with the
//! returned [`CreditTransaction`] in one unit of work, so the decision and
//! the write can never interleave with another request for the same user.

use chrono::{DateTime, Utc};

use crate::{
    credit_expiry_from, BillingError, CreditTransaction, GrantReason, Plan, Result, User,
};

/// Plan/entitlement mutation derived from a billing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementChange {
    /// First entry into a plan via checkout; applied unconditionally.
    Purchase {
        /// Purchased plan.
        plan: Plan,
        /// Billing-provider customer to link, if known.
        customer_id: Option<String>,
    },

    /// Entitled subscription; applied only when the plan differs.
    SwitchPlan {
        /// Plan resolved from the subscription's price.
        plan: Plan,
    },

    /// Recurring renewal; grants the allotment without changing the plan.
    Renew {
        /// Plan resolved from the invoice line item.
        plan: Plan,
    },

    /// Revoked subscription; reverts to basic unless already basic.
    RevertToBasic,

    /// Provider customer deleted; unlinks and reverts to basic.
    DetachCustomer,
}

impl EntitlementChange {
    /// Provider customer this change links to the user.
    ///
    /// A customer belongs to at most one user; stores unlink any previous
    /// holder in the same unit of work.
    #[must_use]
    pub fn linked_customer(&self) -> Option<&str> {
        match self {
            Self::Purchase { customer_id, .. } => customer_id.as_deref(),
            _ => None,
        }
    }
}

/// Result of applying an [`EntitlementChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementEffect {
    /// Whether the user row changed and must be written.
    pub changed: bool,
    /// Credit transaction to record, when credits were granted.
    pub transaction: Option<CreditTransaction>,
}

impl EntitlementEffect {
    const fn unchanged() -> Self {
        Self {
            changed: false,
            transaction: None,
        }
    }
}

/// A rejected spend.
///
/// When the balance had expired, `expired` carries the transaction recording
/// the removal and the user row has been zeroed; the caller must persist
/// both even though the spend failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRejection {
    /// Why the spend was rejected.
    pub error: BillingError,
    /// Expiry transaction when an expired balance was zeroed.
    pub expired: Option<CreditTransaction>,
}

/// Add `amount` credits, optionally replacing the expiry.
///
/// # Errors
///
/// Returns `BillingError::InvalidAmount` if `amount` is not positive.
pub fn grant_credits(
    user: &mut User,
    reason: &GrantReason,
    amount: i64,
    new_expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<CreditTransaction> {
    if amount <= 0 {
        return Err(BillingError::InvalidAmount(amount));
    }

    user.credit_balance += amount;
    if let Some(expiry) = new_expiry {
        user.credits_expires_at = Some(expiry);
    }
    user.updated_at = now;

    Ok(CreditTransaction::grant(
        user.id,
        reason,
        amount,
        user.credit_balance,
        now,
    ))
}

/// Spend one credit to open the reading session `session_id`.
///
/// # Errors
///
/// - `InsufficientCredits` when the stored balance is below one.
/// - `CreditsExpired` when the balance has passed its expiry; the balance
///   is zeroed as a side effect.
pub fn spend_credit(
    user: &mut User,
    session_id: &str,
    now: DateTime<Utc>,
) -> std::result::Result<CreditTransaction, SpendRejection> {
    if user.credit_balance < 1 {
        return Err(SpendRejection {
            error: BillingError::InsufficientCredits {
                balance: user.credit_balance.max(0),
                required: 1,
            },
            expired: None,
        });
    }

    if let Some(expired_at) = user.credits_expires_at.filter(|at| *at < now) {
        let expired_amount = user.credit_balance;
        user.credit_balance = 0;
        user.updated_at = now;
        return Err(SpendRejection {
            error: BillingError::CreditsExpired { expired_at },
            expired: Some(CreditTransaction::expiry(user.id, expired_amount, now)),
        });
    }

    user.credit_balance -= 1;
    user.ai_readings_usage = user.ai_readings_usage.saturating_add(1);
    user.updated_at = now;

    Ok(CreditTransaction::reading_charge(
        user.id,
        session_id,
        user.credit_balance,
        now,
    ))
}

/// Apply a plan/entitlement change.
#[must_use]
pub fn apply_entitlement(
    user: &mut User,
    change: &EntitlementChange,
    now: DateTime<Utc>,
) -> EntitlementEffect {
    match change {
        EntitlementChange::Purchase { plan, customer_id } => {
            if let Some(customer_id) = customer_id {
                user.stripe_customer_id = Some(customer_id.clone());
            }
            enter_plan(user, *plan, now)
        }
        EntitlementChange::SwitchPlan { plan } => {
            if user.plan == *plan {
                return EntitlementEffect::unchanged();
            }
            enter_plan(user, *plan, now)
        }
        EntitlementChange::Renew { plan } => {
            let reason = GrantReason::PlanRenewal { plan: *plan };
            refill(user, &reason, plan.monthly_credits(), now)
        }
        EntitlementChange::RevertToBasic => {
            if user.plan == Plan::Basic {
                return EntitlementEffect::unchanged();
            }
            user.plan = Plan::Basic;
            user.updated_at = now;
            EntitlementEffect {
                changed: true,
                transaction: None,
            }
        }
        EntitlementChange::DetachCustomer => {
            if user.plan == Plan::Basic && user.stripe_customer_id.is_none() {
                return EntitlementEffect::unchanged();
            }
            user.plan = Plan::Basic;
            user.stripe_customer_id = None;
            user.updated_at = now;
            EntitlementEffect {
                changed: true,
                transaction: None,
            }
        }
    }
}

fn enter_plan(user: &mut User, plan: Plan, now: DateTime<Utc>) -> EntitlementEffect {
    user.plan = plan;
    let reason = GrantReason::PlanPurchase { plan };
    refill(user, &reason, plan.monthly_credits(), now)
}

/// Grant a plan allotment: reset usage, extend expiry, add credits.
fn refill(
    user: &mut User,
    reason: &GrantReason,
    credits: i64,
    now: DateTime<Utc>,
) -> EntitlementEffect {
    user.reset_usage();
    let expiry = credit_expiry_from(now);

    let transaction = if credits > 0 {
        grant_credits(user, reason, credits, Some(expiry), now).ok()
    } else {
        user.credits_expires_at = Some(expiry);
        user.updated_at = now;
        None
    };

    EntitlementEffect {
        changed: true,
        transaction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::test_user;
    use crate::TransactionKind;
    use chrono::Duration;

    #[test]
    fn grant_sets_expiry_and_adds() {
        let now = Utc::now();
        let mut user = test_user(2, None);
        let expiry = credit_expiry_from(now);

        let tx = grant_credits(&mut user, &GrantReason::Registration, 10, Some(expiry), now)
            .unwrap();

        assert_eq!(user.credit_balance, 12);
        assert_eq!(user.credits_expires_at, Some(expiry));
        assert_eq!(tx.amount, 10);
        assert_eq!(tx.balance_after, 12);
        assert_eq!(tx.kind, TransactionKind::RegistrationBonus);
    }

    #[test]
    fn grant_without_expiry_keeps_existing_expiry() {
        let now = Utc::now();
        let existing = now + Duration::days(3);
        let mut user = test_user(0, Some(existing));

        grant_credits(
            &mut user,
            &GrantReason::Invitation {
                invitee: crate::UserId::new(2),
            },
            10,
            None,
            now,
        )
        .unwrap();

        assert_eq!(user.credit_balance, 10);
        assert_eq!(user.credits_expires_at, Some(existing));
    }

    #[test]
    fn grant_rejects_non_positive_amounts() {
        let mut user = test_user(1, None);
        let err = grant_credits(&mut user, &GrantReason::Registration, 0, None, Utc::now())
            .unwrap_err();
        assert_eq!(err, BillingError::InvalidAmount(0));
        assert_eq!(user.credit_balance, 1);
    }

    #[test]
    fn spend_decrements_by_one() {
        let now = Utc::now();
        let mut user = test_user(1, Some(now + Duration::days(1)));

        let tx = spend_credit(&mut user, "s1", now).unwrap();

        assert_eq!(user.credit_balance, 0);
        assert_eq!(user.ai_readings_usage, 1);
        assert_eq!(tx.amount, -1);
        assert_eq!(tx.balance_after, 0);
    }

    #[test]
    fn spend_with_empty_balance_is_rejected() {
        let mut user = test_user(0, None);
        let rejection = spend_credit(&mut user, "s1", Utc::now()).unwrap_err();
        assert_eq!(
            rejection.error,
            BillingError::InsufficientCredits {
                balance: 0,
                required: 1
            }
        );
        assert!(rejection.expired.is_none());
        assert_eq!(user.credit_balance, 0);
    }

    #[test]
    fn spend_with_expired_balance_zeroes_it() {
        let now = Utc::now();
        let expired_at = now - Duration::minutes(5);
        let mut user = test_user(5, Some(expired_at));

        let rejection = spend_credit(&mut user, "s1", now).unwrap_err();

        assert_eq!(rejection.error, BillingError::CreditsExpired { expired_at });
        assert!(rejection.error.is_payment_required());
        let expiry_tx = rejection.expired.unwrap();
        assert_eq!(expiry_tx.amount, -5);
        assert_eq!(user.credit_balance, 0);
    }

    #[test]
    fn balance_never_goes_negative() {
        let now = Utc::now();
        let mut user = test_user(3, None);
        let mut spent = 0;
        for i in 0..10 {
            if spend_credit(&mut user, &format!("s{i}"), now).is_ok() {
                spent += 1;
            }
            assert!(user.credit_balance >= 0);
        }
        assert_eq!(spent, 3);
        assert_eq!(user.credit_balance, 0);
    }

    #[test]
    fn purchase_grants_allotment_and_links_customer() {
        let now = Utc::now();
        let mut user = test_user(4, None);
        user.ai_readings_usage = 7;
        user.consultation_usage = 2;

        let effect = apply_entitlement(
            &mut user,
            &EntitlementChange::Purchase {
                plan: Plan::Pro,
                customer_id: Some("cus_1".into()),
            },
            now,
        );

        assert!(effect.changed);
        assert_eq!(effect.transaction.unwrap().amount, Plan::Pro.monthly_credits());
        assert_eq!(user.plan, Plan::Pro);
        assert_eq!(user.credit_balance, 4 + Plan::Pro.monthly_credits());
        assert_eq!(user.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(user.ai_readings_usage, 0);
        assert_eq!(user.consultation_usage, 0);
        assert_eq!(user.credits_expires_at, Some(credit_expiry_from(now)));
    }

    #[test]
    fn switch_to_same_plan_is_a_no_op() {
        let now = Utc::now();
        let mut user = test_user(4, None);
        user.plan = Plan::Premium;
        let before = user.clone();

        let effect = apply_entitlement(
            &mut user,
            &EntitlementChange::SwitchPlan {
                plan: Plan::Premium,
            },
            now,
        );

        assert!(!effect.changed);
        assert_eq!(user, before);
    }

    #[test]
    fn switch_to_basic_grants_nothing_but_resets_usage() {
        let now = Utc::now();
        let mut user = test_user(4, None);
        user.plan = Plan::Pro;
        user.ai_readings_usage = 3;

        let effect = apply_entitlement(
            &mut user,
            &EntitlementChange::SwitchPlan { plan: Plan::Basic },
            now,
        );

        assert!(effect.changed);
        assert!(effect.transaction.is_none());
        assert_eq!(user.plan, Plan::Basic);
        assert_eq!(user.credit_balance, 4);
        assert_eq!(user.ai_readings_usage, 0);
    }

    #[test]
    fn renewal_keeps_plan() {
        let now = Utc::now();
        let mut user = test_user(1, None);
        user.plan = Plan::Pro;

        let effect = apply_entitlement(
            &mut user,
            &EntitlementChange::Renew {
                plan: Plan::Premium,
            },
            now,
        );

        assert_eq!(user.plan, Plan::Pro);
        assert_eq!(user.credit_balance, 1 + Plan::Premium.monthly_credits());
        assert_eq!(effect.transaction.unwrap().kind, TransactionKind::PlanRenewal);
    }

    #[test]
    fn revert_keeps_credits() {
        let now = Utc::now();
        let mut user = test_user(42, None);
        user.plan = Plan::Premium;

        let effect = apply_entitlement(&mut user, &EntitlementChange::RevertToBasic, now);
        assert!(effect.changed);
        assert_eq!(user.plan, Plan::Basic);
        assert_eq!(user.credit_balance, 42);

        let again = apply_entitlement(&mut user, &EntitlementChange::RevertToBasic, now);
        assert!(!again.changed);
    }

    #[test]
    fn detach_customer_unlinks_and_reverts() {
        let now = Utc::now();
        let mut user = test_user(5, None);
        user.plan = Plan::Pro;
        user.stripe_customer_id = Some("cus_9".into());

        let effect = apply_entitlement(&mut user, &EntitlementChange::DetachCustomer, now);

        assert!(effect.changed);
        assert_eq!(user.plan, Plan::Basic);
        assert!(user.stripe_customer_id.is_none());
        assert_eq!(user.credit_balance, 5);
    }

    #[test]
    fn only_purchases_link_a_customer() {
        let purchase = EntitlementChange::Purchase {
            plan: Plan::Pro,
            customer_id: Some("cus_1".into()),
        };
        assert_eq!(purchase.linked_customer(), Some("cus_1"));

        let anonymous = EntitlementChange::Purchase {
            plan: Plan::Pro,
            customer_id: None,
        };
        assert_eq!(anonymous.linked_customer(), None);
        assert_eq!(EntitlementChange::Renew { plan: Plan::Pro }.linked_customer(), None);
        assert_eq!(EntitlementChange::DetachCustomer.linked_customer(), None);
    }
}
