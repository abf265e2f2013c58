//! Error types for tarot-billing.

use chrono::{DateTime, Utc};

use crate::ids::IdError;

/// Result type for tarot-billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in ledger and billing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// Not enough credits to open a reading.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Usable balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The balance expired before it could be spent.
    #[error("credits expired at {expired_at}")]
    CreditsExpired {
        /// When the balance expired.
        expired_at: DateTime<Utc>,
    },

    /// A grant amount was zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// A billing event referenced a plan name that is not known.
    #[error("unrecognized plan: {0}")]
    UnrecognizedPlan(String),

    /// A billing event payload could not be interpreted.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl BillingError {
    /// Whether this error means the caller must pay before continuing.
    #[must_use]
    pub const fn is_payment_required(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredits { .. } | Self::CreditsExpired { .. }
        )
    }
}
