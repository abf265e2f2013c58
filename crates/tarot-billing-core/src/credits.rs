//! Credit transaction types for tarot-billing.
//!
//! Every change to a user's balance is recorded as a [`CreditTransaction`]
//! in the same unit of work as the balance update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Plan, TransactionId, UserId};

/// A credit transaction representing a balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Signed amount. Positive = credit, negative = debit.
    pub amount: i64,

    /// Type of transaction.
    pub kind: TransactionKind,

    /// Balance after this transaction.
    pub balance_after: i64,

    /// Human-readable description.
    pub description: String,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    fn new(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        balance_after: i64,
        description: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            kind,
            balance_after,
            description,
            created_at: now,
        }
    }

    /// A grant of credits for the given reason.
    #[must_use]
    pub fn grant(
        user_id: UserId,
        reason: &GrantReason,
        amount: i64,
        balance_after: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            amount,
            reason.kind(),
            balance_after,
            reason.describe(),
            now,
        )
    }

    /// The one-credit charge for opening a reading session.
    #[must_use]
    pub fn reading_charge(
        user_id: UserId,
        session_id: &str,
        balance_after: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            -1,
            TransactionKind::ReadingCharge,
            balance_after,
            format!("Reading session {session_id}"),
            now,
        )
    }

    /// Removal of an expired balance.
    #[must_use]
    pub fn expiry(user_id: UserId, expired_amount: i64, now: DateTime<Utc>) -> Self {
        Self::new(
            user_id,
            -expired_amount.abs(),
            TransactionKind::Expiry,
            0,
            format!("{expired_amount} credits expired"),
            now,
        )
    }
}

/// Why credits were granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantReason {
    /// Sign-up bonus.
    Registration,

    /// Reward for inviting the given user.
    Invitation {
        /// The newly registered invitee.
        invitee: UserId,
    },

    /// First purchase of a paid plan.
    PlanPurchase {
        /// The purchased plan.
        plan: Plan,
    },

    /// Recurring renewal of a plan.
    PlanRenewal {
        /// The renewed plan.
        plan: Plan,
    },

    /// Administrative grant or redemption code.
    Redemption {
        /// Free-form note for the audit trail.
        note: String,
    },
}

impl GrantReason {
    /// Transaction kind recorded for this grant.
    #[must_use]
    pub const fn kind(&self) -> TransactionKind {
        match self {
            Self::Registration => TransactionKind::RegistrationBonus,
            Self::Invitation { .. } => TransactionKind::InvitationReward,
            Self::PlanPurchase { .. } => TransactionKind::PlanPurchase,
            Self::PlanRenewal { .. } => TransactionKind::PlanRenewal,
            Self::Redemption { .. } => TransactionKind::Redemption,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Registration => "Registration bonus".to_string(),
            Self::Invitation { invitee } => format!("Invitation reward for user {invitee}"),
            Self::PlanPurchase { plan } => format!("{plan} plan purchase"),
            Self::PlanRenewal { plan } => format!("{plan} plan renewal"),
            Self::Redemption { note } => note.clone(),
        }
    }
}

/// Type of credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Sign-up bonus.
    RegistrationBonus,

    /// Reward for a successful invitation.
    InvitationReward,

    /// Credits granted with a first plan purchase.
    PlanPurchase,

    /// Credits granted on plan renewal.
    PlanRenewal,

    /// Administrative grant or redeemed code.
    Redemption,

    /// One credit spent to open a reading session.
    ReadingCharge,

    /// Expired balance removed.
    Expiry,
}

impl TransactionKind {
    /// Stable snake-case name, as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationBonus => "registration_bonus",
            Self::InvitationReward => "invitation_reward",
            Self::PlanPurchase => "plan_purchase",
            Self::PlanRenewal => "plan_renewal",
            Self::Redemption => "redemption",
            Self::ReadingCharge => "reading_charge",
            Self::Expiry => "expiry",
        }
    }

    /// Parse a stored name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "registration_bonus" => Some(Self::RegistrationBonus),
            "invitation_reward" => Some(Self::InvitationReward),
            "plan_purchase" => Some(Self::PlanPurchase),
            "plan_renewal" => Some(Self::PlanRenewal),
            "redemption" => Some(Self::Redemption),
            "reading_charge" => Some(Self::ReadingCharge),
            "expiry" => Some(Self::Expiry),
            _ => None,
        }
    }

    /// Check if this transaction type adds credits.
    #[must_use]
    pub const fn is_credit(self) -> bool {
        !self.is_debit()
    }

    /// Check if this transaction type removes credits.
    #[must_use]
    pub const fn is_debit(self) -> bool {
        matches!(self, Self::ReadingCharge | Self::Expiry)
    }
}
