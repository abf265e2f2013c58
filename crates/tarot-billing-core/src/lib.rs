//! Core types and ledger logic for tarot-billing.
//!
//! This crate provides the foundational types used throughout tarot-billing:
//!
//! - **Identifiers**: `UserId`, `SessionId`, `TransactionId`
//! - **Users**: `User`, `Plan`, registration and plan constants
//! - **Credits**: `CreditTransaction`, `TransactionKind`, `GrantReason`
//! - **Ledger**: `grant_credits`, `spend_credit`, `apply_entitlement`
//! - **Billing**: `BillingEvent`, `Subscription`, `PlanCatalog`
//! - **Readings**: `ReadingSession`, `CardDrawn`, `Message`
//!
//! # Credits
//!
//! **1 credit = 1 reading session**
//!
//! - New account → 10 credits, valid for 30 days
//! - Pro / Premium purchase or renewal → 30 / 100 credits, valid for 30 days
//! - Opening a reading session → 1 credit, charged once per session id
//! - Stored as `i64`; never negative, treated as zero once expired

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credits;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod reading;
pub mod subscription;
pub mod user;

pub use credits::{CreditTransaction, GrantReason, TransactionKind};
pub use error::{BillingError, Result};
pub use events::{
    BillingEvent, CheckoutCompletion, EventPayload, InvoicePayment, SubscriptionSnapshot,
    DEFAULT_PERIOD_DAYS,
};
pub use ids::{IdError, SessionId, TransactionId, UserId, MAX_SESSION_ID_LEN};
pub use ledger::{
    apply_entitlement, grant_credits, spend_credit, EntitlementChange, EntitlementEffect,
    SpendRejection,
};
pub use pricing::{PlanCatalog, PlanResolution};
pub use reading::{CardDrawn, ChargeOutcome, Message, MessageRole, NewReading, ReadingSession};
pub use subscription::{Entitlement, Subscription, SubscriptionStatus};
pub use user::{
    credit_expiry_from, generate_invitation_code, NewUser, Plan, User, CREDIT_VALIDITY_DAYS,
    INVITATION_CODE_LEN, INVITATION_REWARD_CREDITS, PREMIUM_PLAN_MONTHLY_CREDITS,
    PRO_PLAN_MONTHLY_CREDITS, REGISTRATION_BONUS_CREDITS,
};
