//! User types for tarot-billing.
//!
//! A [`User`] carries the credit ledger (balance + expiry), the entitlement
//! (plan tier and usage counters) and the link to the billing provider.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

// ============================================================================
// Constants
// ============================================================================

/// Credits granted to every new account.
pub const REGISTRATION_BONUS_CREDITS: i64 = 10;

/// Credits granted to the inviter when an invited user registers.
pub const INVITATION_REWARD_CREDITS: i64 = 10;

/// Validity of a registration bonus or a plan grant, in days.
pub const CREDIT_VALIDITY_DAYS: i64 = 30;

/// Pro plan monthly reading allotment.
pub const PRO_PLAN_MONTHLY_CREDITS: i64 = 30;

/// Premium plan monthly reading allotment.
pub const PREMIUM_PLAN_MONTHLY_CREDITS: i64 = 100;

/// Length of generated invitation codes.
pub const INVITATION_CODE_LEN: usize = 8;

/// Expiry timestamp for a grant issued at `now`.
#[must_use]
pub fn credit_expiry_from(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(CREDIT_VALIDITY_DAYS)
}

/// Generate a fresh invitation code (upper-case alphanumerics).
///
/// Uniqueness is enforced by the store; callers retry on collision.
#[must_use]
pub fn generate_invitation_code() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(INVITATION_CODE_LEN)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// An account holder and their credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned identity.
    pub id: UserId,

    /// Login email, unique across users.
    pub email: String,

    /// Stored credit balance. Never negative.
    pub credit_balance: i64,

    /// When the balance expires, if ever.
    pub credits_expires_at: Option<DateTime<Utc>>,

    /// Current plan tier.
    pub plan: Plan,

    /// Stripe customer ID, set on first checkout.
    pub stripe_customer_id: Option<String>,

    /// AI readings used in the current period.
    pub ai_readings_usage: i32,

    /// Consultations used in the current period.
    pub consultation_usage: i32,

    /// This user's own invitation code.
    pub invitation_code: String,

    /// The user whose invitation code was used at registration.
    pub invited_by: Option<UserId>,

    /// When the user was created.
    pub created_at: DateTime<Utc>,

    /// When the user was last updated.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Whether the stored balance has passed its expiry at `now`.
    #[must_use]
    pub fn credits_expired(&self, now: DateTime<Utc>) -> bool {
        self.credits_expires_at.is_some_and(|at| at < now)
    }

    /// Balance available for spending at `now` (zero once expired).
    #[must_use]
    pub fn usable_credits(&self, now: DateTime<Utc>) -> i64 {
        if self.credits_expired(now) {
            0
        } else {
            self.credit_balance
        }
    }

    /// Reset the per-period usage counters.
    pub fn reset_usage(&mut self) {
        self.ai_readings_usage = 0;
        self.consultation_usage = 0;
    }
}

/// Input for creating a user at registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login email.
    pub email: String,

    /// Invitation code of an existing user, if the new user was invited.
    pub invite_code: Option<String>,
}

/// Available plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Basic tier: registration credits only, no monthly grant.
    Basic,

    /// Pro plan: monthly reading allotment.
    Pro,

    /// Premium plan: larger monthly reading allotment.
    Premium,
}

impl Plan {
    /// All plans, in ascending order.
    pub const ALL: [Self; 3] = [Self::Basic, Self::Pro, Self::Premium];

    /// Monthly credit allotment granted on purchase and renewal.
    #[must_use]
    pub const fn monthly_credits(self) -> i64 {
        match self {
            Self::Basic => 0,
            Self::Pro => PRO_PLAN_MONTHLY_CREDITS,
            Self::Premium => PREMIUM_PLAN_MONTHLY_CREDITS,
        }
    }

    /// Canonical lower-case name, as stored and as sent in checkout metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Premium => "premium",
        }
    }

    /// Parse a plan name; unknown names yield `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(Self::Basic),
            "pro" => Some(Self::Pro),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
pub(crate) fn test_user(balance: i64, expires_at: Option<DateTime<Utc>>) -> User {
    let now = Utc::now();
    User {
        id: UserId::new(1),
        email: "seeker@example.com".into(),
        credit_balance: balance,
        credits_expires_at: expires_at,
        plan: Plan::Basic,
        stripe_customer_id: None,
        ai_readings_usage: 0,
        consultation_usage: 0,
        invitation_code: "ABCD1234".into(),
        invited_by: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_balance_is_not_usable() {
        let now = Utc::now();
        let user = test_user(5, Some(now - Duration::hours(1)));
        assert!(user.credits_expired(now));
        assert_eq!(user.usable_credits(now), 0);
        assert_eq!(user.credit_balance, 5);
    }

    #[test]
    fn balance_without_expiry_never_expires() {
        let user = test_user(3, None);
        let far_future = Utc::now() + Duration::days(10_000);
        assert!(!user.credits_expired(far_future));
        assert_eq!(user.usable_credits(far_future), 3);
    }

    #[test]
    fn plan_monthly_credits() {
        assert_eq!(Plan::Basic.monthly_credits(), 0);
        assert_eq!(Plan::Pro.monthly_credits(), 30);
        assert_eq!(Plan::Premium.monthly_credits(), 100);
    }

    #[test]
    fn plan_names_roundtrip() {
        for plan in Plan::ALL {
            assert_eq!(Plan::from_name(plan.as_str()), Some(plan));
        }
        assert_eq!(Plan::from_name("PRO"), Some(Plan::Pro));
        assert_eq!(Plan::from_name("enterprise"), None);
    }

    #[test]
    fn invitation_codes_are_upper_alphanumeric() {
        let code = generate_invitation_code();
        assert_eq!(code.len(), INVITATION_CODE_LEN);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn credit_expiry_is_thirty_days_out() {
        let now = Utc::now();
        assert_eq!(credit_expiry_from(now) - now, Duration::days(30));
    }
}
